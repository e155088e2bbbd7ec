//! Store traits: the abstract interfaces for documents and the relay queue.
//!
//! These traits keep the sync protocol storage-agnostic. Implementations
//! include SQLite (primary) and in-memory (for tests).

use std::time::Duration;

use async_trait::async_trait;
use docrelay_core::{
    Document, EntryStatus, Location, NewEntry, ObjectId, QueueId, RelayQueueEntry, RetryPolicy,
    ID_FIELD,
};

use crate::error::Result;

/// Result of upserting a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertResult {
    /// No document with that id existed; one was created.
    Inserted,
    /// An existing document had at least one field changed.
    Updated,
    /// The existing document already carried these field values.
    Unchanged,
}

/// Which part of the relay queue an operation looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueFilter {
    /// Every entry (a peer's single outbound queue).
    Any,
    /// Entries addressed to one location (a hub's per-peer queue).
    Destination(Location),
}

impl QueueFilter {
    /// Filter on a destination location.
    pub fn destination(location: impl Into<Location>) -> Self {
        QueueFilter::Destination(location.into())
    }

    /// Whether `entry` falls under this filter.
    pub fn matches(&self, entry: &RelayQueueEntry) -> bool {
        match self {
            QueueFilter::Any => true,
            QueueFilter::Destination(location) => &entry.destination_location == location,
        }
    }

    /// The destination, if filtering on one.
    pub fn location(&self) -> Option<&Location> {
        match self {
            QueueFilter::Any => None,
            QueueFilter::Destination(location) => Some(location),
        }
    }
}

/// Async interface for the replicated collections.
///
/// Documents are keyed by `(collection, _id)` and keep their insertion order.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// The earliest-inserted document of a collection.
    async fn find_oldest_document(&self, collection: &str) -> Result<Option<Document>>;

    /// Get a document by id.
    async fn get_document(&self, collection: &str, id: &ObjectId) -> Result<Option<Document>>;

    /// Field-set upsert keyed by id.
    ///
    /// Only fields present in `fields` are overwritten; other stored fields
    /// stay untouched. An `_id` key in `fields` is ignored. Applying the same
    /// fields twice leaves the store as applying them once.
    async fn upsert_document(
        &self,
        collection: &str,
        id: &ObjectId,
        fields: &Document,
    ) -> Result<UpsertResult>;

    /// Insert a new document, minting `_id` when absent.
    async fn insert_document(&self, collection: &str, doc: Document) -> Result<ObjectId>;

    /// Delete a document. Returns whether it existed.
    async fn delete_document(&self, collection: &str, id: &ObjectId) -> Result<bool>;

    /// Number of documents in a collection.
    async fn count_documents(&self, collection: &str) -> Result<usize>;
}

/// Async interface for the durable relay queue.
///
/// # Design Notes
///
/// - **Eligibility**: peeks and claims skip dead letters, entries whose
///   `retry_at` lies in the future, and entries under an unexpired claim.
/// - **Atomic claim**: `claim_oldest` selects and leases in one step.
/// - **Order**: within a filter, entries come out in ascending `queue_id`.
/// - **Per-document order**: an entry is held back while an older entry
///   that is not dead-lettered targets the same destination, collection
///   and `_id` (see [`DeliveryKey`](docrelay_core::DeliveryKey)). A
///   deferred write therefore blocks later writes of the same document
///   and nothing else.
#[async_trait]
pub trait RelayQueueStore: Send + Sync {
    /// Append an entry. Returns its fresh, ascending id.
    async fn enqueue(&self, entry: NewEntry) -> Result<QueueId>;

    /// The oldest eligible entry, without claiming it.
    async fn peek_oldest(&self, filter: &QueueFilter) -> Result<Option<RelayQueueEntry>>;

    /// Atomically take the oldest eligible entry for `lease`.
    ///
    /// The entry stays persisted; it is hidden from other claimers until it
    /// is deleted, released, or the lease runs out.
    async fn claim_oldest(
        &self,
        filter: &QueueFilter,
        lease: Duration,
    ) -> Result<Option<RelayQueueEntry>>;

    /// Drop the claim on an entry so it is offered again.
    async fn release_claim(&self, id: QueueId) -> Result<()>;

    /// Remove an entry after confirmed delivery. Idempotent.
    async fn delete_entry(&self, id: QueueId) -> Result<bool>;

    /// Record a failed delivery. Returns `None` if the entry is gone.
    async fn mark_error(
        &self,
        id: QueueId,
        message: &str,
        policy: &RetryPolicy,
    ) -> Result<Option<EntryStatus>>;

    /// Reset an entry (dead letter included) so it is offered right away.
    async fn requeue_entry(&self, id: QueueId) -> Result<bool>;

    /// Get an entry by id, eligible or not.
    async fn get_entry(&self, id: QueueId) -> Result<Option<RelayQueueEntry>>;

    /// All entries under the filter, oldest first.
    async fn list_entries(&self, filter: &QueueFilter) -> Result<Vec<RelayQueueEntry>>;

    /// Dead-lettered entries under the filter, oldest first.
    async fn dead_letters(&self, filter: &QueueFilter) -> Result<Vec<RelayQueueEntry>>;

    /// Number of entries under the filter, eligible or not.
    async fn queue_len(&self, filter: &QueueFilter) -> Result<usize>;
}

/// A backend holding both the replicated documents and the relay queue.
///
/// Hubs and peers keep both in one store so a document change and the
/// queue entries that replicate it commit together.
#[async_trait]
pub trait RelayStore: DocumentStore + RelayQueueStore {
    /// Upsert `fields` into `(collection, id)` and enqueue `entries`, all
    /// or nothing.
    ///
    /// Entry ids are returned in the order of `entries`.
    async fn upsert_and_enqueue(
        &self,
        collection: &str,
        id: &ObjectId,
        fields: &Document,
        entries: Vec<NewEntry>,
    ) -> Result<(UpsertResult, Vec<QueueId>)>;
}

/// Overwrite `target` with `fields`, skipping `_id`.
///
/// Returns whether any stored value changed.
pub fn merge_fields(target: &mut Document, fields: &Document) -> bool {
    let mut changed = false;
    for (key, value) in fields {
        if key == ID_FIELD {
            continue;
        }
        if target.get(key) != Some(value) {
            target.insert(key.clone(), value.clone());
            changed = true;
        }
    }
    changed
}
