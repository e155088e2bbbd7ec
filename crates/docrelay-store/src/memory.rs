//! In-memory implementation of the store traits.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;

use docrelay_core::{
    now_millis, Document, EntryStatus, NewEntry, ObjectId, QueueId, RelayQueueEntry,
    RetryPolicy, Value, ID_FIELD,
};

use crate::error::{Result, StoreError};
use crate::traits::{
    merge_fields, DocumentStore, QueueFilter, RelayQueueStore, RelayStore, UpsertResult,
};

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    /// Collections by name.
    collections: HashMap<String, Collection>,

    /// Relay queue, ordered by id.
    queue: BTreeMap<QueueId, RelayQueueEntry>,

    /// Last assigned queue id.
    last_queue_id: u64,
}

#[derive(Default)]
struct Collection {
    /// Documents with their insertion sequence.
    docs: HashMap<ObjectId, (u64, Document)>,
    next_seq: u64,
}

impl Collection {
    fn insert(&mut self, id: ObjectId, doc: Document) {
        self.next_seq += 1;
        self.docs.insert(id, (self.next_seq, doc));
    }
}

impl MemoryStoreInner {
    fn upsert(&mut self, collection: &str, id: &ObjectId, fields: &Document) -> UpsertResult {
        let coll = self.collections.entry(collection.to_string()).or_default();

        if let Some((_, existing)) = coll.docs.get_mut(id) {
            return if merge_fields(existing, fields) {
                UpsertResult::Updated
            } else {
                UpsertResult::Unchanged
            };
        }

        let mut doc = Document::new();
        doc.insert(ID_FIELD.to_string(), Value::ObjectId(*id));
        merge_fields(&mut doc, fields);
        coll.insert(*id, doc);
        UpsertResult::Inserted
    }

    fn enqueue(&mut self, entry: NewEntry) -> QueueId {
        self.last_queue_id += 1;
        let id = QueueId(self.last_queue_id);
        self.queue.insert(id, entry.into_entry(id));
        id
    }

    /// The oldest entry under `filter` that may go out at `now`.
    ///
    /// Walks the queue in order and remembers the delivery key of every
    /// live entry it passes, so a newer write of the same document stays
    /// behind a deferred or claimed older one.
    fn next_deliverable(&self, filter: &QueueFilter, now: i64) -> Option<QueueId> {
        let mut held = HashSet::new();
        for entry in self.queue.values() {
            if entry.dead_letter {
                continue;
            }
            let key = entry.delivery_key();
            if key.as_ref().is_some_and(|k| held.contains(k)) {
                continue;
            }
            if filter.matches(entry) && entry.is_eligible(now) {
                return Some(entry.queue_id);
            }
            if let Some(key) = key {
                held.insert(key);
            }
        }
        None
    }
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryStoreInner::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreInner>> {
        self.inner
            .read()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreInner>> {
        self.inner
            .write()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find_oldest_document(&self, collection: &str) -> Result<Option<Document>> {
        let inner = self.read()?;
        Ok(inner.collections.get(collection).and_then(|c| {
            c.docs
                .values()
                .min_by_key(|(seq, _)| *seq)
                .map(|(_, doc)| doc.clone())
        }))
    }

    async fn get_document(&self, collection: &str, id: &ObjectId) -> Result<Option<Document>> {
        let inner = self.read()?;
        Ok(inner
            .collections
            .get(collection)
            .and_then(|c| c.docs.get(id))
            .map(|(_, doc)| doc.clone()))
    }

    async fn upsert_document(
        &self,
        collection: &str,
        id: &ObjectId,
        fields: &Document,
    ) -> Result<UpsertResult> {
        let mut inner = self.write()?;
        Ok(inner.upsert(collection, id, fields))
    }

    async fn insert_document(&self, collection: &str, mut doc: Document) -> Result<ObjectId> {
        let id = match doc.get(ID_FIELD) {
            Some(_) => docrelay_core::document_id(&doc)
                .map_err(|e| StoreError::InvalidData(e.to_string()))?,
            None => ObjectId::new(),
        };
        doc.insert(ID_FIELD.to_string(), Value::ObjectId(id));

        let mut inner = self.write()?;
        let coll = inner.collections.entry(collection.to_string()).or_default();
        if coll.docs.contains_key(&id) {
            return Err(StoreError::InvalidData(format!(
                "duplicate _id {id} in {collection}"
            )));
        }
        coll.insert(id, doc);
        Ok(id)
    }

    async fn delete_document(&self, collection: &str, id: &ObjectId) -> Result<bool> {
        let mut inner = self.write()?;
        Ok(inner
            .collections
            .get_mut(collection)
            .map(|c| c.docs.remove(id).is_some())
            .unwrap_or(false))
    }

    async fn count_documents(&self, collection: &str) -> Result<usize> {
        let inner = self.read()?;
        Ok(inner.collections.get(collection).map_or(0, |c| c.docs.len()))
    }
}

#[async_trait]
impl RelayQueueStore for MemoryStore {
    async fn enqueue(&self, entry: NewEntry) -> Result<QueueId> {
        let mut inner = self.write()?;
        Ok(inner.enqueue(entry))
    }

    async fn peek_oldest(&self, filter: &QueueFilter) -> Result<Option<RelayQueueEntry>> {
        let now = now_millis();
        let inner = self.read()?;
        Ok(inner
            .next_deliverable(filter, now)
            .and_then(|id| inner.queue.get(&id))
            .cloned())
    }

    async fn claim_oldest(
        &self,
        filter: &QueueFilter,
        lease: Duration,
    ) -> Result<Option<RelayQueueEntry>> {
        let now = now_millis();
        let mut inner = self.write()?;
        let Some(id) = inner.next_deliverable(filter, now) else {
            return Ok(None);
        };
        Ok(inner.queue.get_mut(&id).map(|e| {
            e.claimed_until = Some(now + lease.as_millis() as i64);
            e.clone()
        }))
    }

    async fn release_claim(&self, id: QueueId) -> Result<()> {
        let mut inner = self.write()?;
        if let Some(entry) = inner.queue.get_mut(&id) {
            entry.claimed_until = None;
        }
        Ok(())
    }

    async fn delete_entry(&self, id: QueueId) -> Result<bool> {
        let mut inner = self.write()?;
        Ok(inner.queue.remove(&id).is_some())
    }

    async fn mark_error(
        &self,
        id: QueueId,
        message: &str,
        policy: &RetryPolicy,
    ) -> Result<Option<EntryStatus>> {
        let now = now_millis();
        let mut inner = self.write()?;
        Ok(inner
            .queue
            .get_mut(&id)
            .map(|entry| entry.record_failure(message, policy, now)))
    }

    async fn requeue_entry(&self, id: QueueId) -> Result<bool> {
        let mut inner = self.write()?;
        Ok(match inner.queue.get_mut(&id) {
            Some(entry) => {
                entry.reset();
                true
            }
            None => false,
        })
    }

    async fn get_entry(&self, id: QueueId) -> Result<Option<RelayQueueEntry>> {
        let inner = self.read()?;
        Ok(inner.queue.get(&id).cloned())
    }

    async fn list_entries(&self, filter: &QueueFilter) -> Result<Vec<RelayQueueEntry>> {
        let inner = self.read()?;
        Ok(inner
            .queue
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect())
    }

    async fn dead_letters(&self, filter: &QueueFilter) -> Result<Vec<RelayQueueEntry>> {
        let inner = self.read()?;
        Ok(inner
            .queue
            .values()
            .filter(|e| e.dead_letter && filter.matches(e))
            .cloned()
            .collect())
    }

    async fn queue_len(&self, filter: &QueueFilter) -> Result<usize> {
        let inner = self.read()?;
        Ok(inner.queue.values().filter(|e| filter.matches(e)).count())
    }
}

#[async_trait]
impl RelayStore for MemoryStore {
    async fn upsert_and_enqueue(
        &self,
        collection: &str,
        id: &ObjectId,
        fields: &Document,
        entries: Vec<NewEntry>,
    ) -> Result<(UpsertResult, Vec<QueueId>)> {
        let mut inner = self.write()?;
        let outcome = inner.upsert(collection, id, fields);
        let ids = entries.into_iter().map(|e| inner.enqueue(e)).collect();
        Ok((outcome, ids))
    }
}
