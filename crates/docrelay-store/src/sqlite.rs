//! SQLite implementation of the store traits.
//!
//! This is the primary storage backend for docrelay. It uses rusqlite with
//! bundled SQLite, wrapped in async via tokio::spawn_blocking.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use docrelay_core::{
    document_id, now_millis, Document, EntryStatus, Location, NewEntry, ObjectId, QueueId,
    RelayQueueEntry, RetryPolicy, Value, ID_FIELD,
};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{
    merge_fields, DocumentStore, QueueFilter, RelayQueueStore, RelayStore, UpsertResult,
};

/// Columns read by [`row_to_entry`], in order.
const ENTRY_COLUMNS: &str = "queue_id, collection, document, origin_location, \
     destination_location, timestamp, error, error_message, attempts, retry_at, \
     dead_letter, claimed_until";

/// Eligible entries under an optional destination, oldest first.
/// `?1` is the current time, `?2` the destination or NULL.
///
/// An entry also waits while an older live entry writes the same document
/// at the same destination.
const ELIGIBLE_WHERE: &str = "dead_letter = 0
       AND (retry_at IS NULL OR retry_at <= ?1)
       AND (claimed_until IS NULL OR claimed_until <= ?1)
       AND (?2 IS NULL OR destination_location = ?2)
       AND NOT EXISTS (
           SELECT 1 FROM relay_queue AS older
            WHERE older.destination_location = relay_queue.destination_location
              AND older.collection = relay_queue.collection
              AND older.doc_id = relay_queue.doc_id
              AND older.queue_id < relay_queue.queue_id
              AND older.dead_letter = 0)";

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        tracing::info!(path = %path.display(), "opened relay store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::Poisoned(e.to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn encode_document(doc: &Document) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(doc, &mut buf).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(buf)
}

fn decode_document(bytes: &[u8]) -> Result<Document> {
    ciborium::from_reader(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<RelayQueueEntry> {
    let body: Vec<u8> = row.get(2)?;
    let document = ciborium::from_reader(&body[..])
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Blob, Box::new(e)))?;

    Ok(RelayQueueEntry {
        queue_id: QueueId(row.get::<_, i64>(0)? as u64),
        collection: row.get(1)?,
        document,
        origin_location: Location::from(row.get::<_, String>(3)?),
        destination_location: Location::from(row.get::<_, String>(4)?),
        timestamp: row.get(5)?,
        error: row.get(6)?,
        error_message: row.get(7)?,
        attempts: row.get(8)?,
        retry_at: row.get(9)?,
        dead_letter: row.get(10)?,
        claimed_until: row.get(11)?,
    })
}

fn select_entries(
    conn: &Connection,
    where_clause: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<RelayQueueEntry>> {
    let sql = format!("SELECT {ENTRY_COLUMNS} FROM relay_queue WHERE {where_clause} ORDER BY queue_id");
    let mut stmt = conn.prepare(&sql)?;
    let entries = stmt
        .query_map(params, row_to_entry)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
}

fn oldest_eligible(
    conn: &Connection,
    now: i64,
    destination: Option<&str>,
) -> Result<Option<RelayQueueEntry>> {
    let sql = format!(
        "SELECT {ENTRY_COLUMNS} FROM relay_queue WHERE {ELIGIBLE_WHERE} ORDER BY queue_id LIMIT 1"
    );
    conn.query_row(&sql, params![now, destination], row_to_entry)
        .optional()
        .map_err(StoreError::from)
}

/// Field-set upsert inside an open transaction.
fn upsert_in(
    conn: &Connection,
    collection: &str,
    id: &ObjectId,
    fields: &Document,
) -> Result<UpsertResult> {
    let now = now_millis();
    let existing: Option<Vec<u8>> = conn
        .query_row(
            "SELECT body FROM documents WHERE collection = ?1 AND doc_id = ?2",
            params![collection, id.as_bytes().as_slice()],
            |row| row.get(0),
        )
        .optional()?;

    Ok(match existing {
        Some(body) => {
            let mut doc = decode_document(&body)?;
            if merge_fields(&mut doc, fields) {
                conn.execute(
                    "UPDATE documents SET body = ?3, updated_at = ?4
                     WHERE collection = ?1 AND doc_id = ?2",
                    params![collection, id.as_bytes().as_slice(), encode_document(&doc)?, now],
                )?;
                UpsertResult::Updated
            } else {
                UpsertResult::Unchanged
            }
        }
        None => {
            let mut doc = Document::new();
            doc.insert(ID_FIELD.to_string(), Value::ObjectId(*id));
            merge_fields(&mut doc, fields);
            conn.execute(
                "INSERT INTO documents (collection, doc_id, body, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![collection, id.as_bytes().as_slice(), encode_document(&doc)?, now],
            )?;
            UpsertResult::Inserted
        }
    })
}

/// Append one queue row. The document id is kept in its own column for
/// per-document ordering.
fn insert_entry(conn: &Connection, entry: &NewEntry) -> Result<QueueId> {
    let body = encode_document(&entry.document)?;
    let doc_id = document_id(&entry.document).ok();
    conn.execute(
        "INSERT INTO relay_queue (
            collection, document, doc_id, origin_location, destination_location,
            timestamp, enqueued_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            entry.collection,
            body,
            doc_id.as_ref().map(|id| id.as_bytes().to_vec()),
            entry.origin_location.as_str(),
            entry.destination_location.as_str(),
            entry.timestamp,
            now_millis(),
        ],
    )?;
    Ok(QueueId(conn.last_insert_rowid() as u64))
}

fn destination_of(filter: &QueueFilter) -> Option<String> {
    filter.location().map(|l| l.as_str().to_string())
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn find_oldest_document(&self, collection: &str) -> Result<Option<Document>> {
        let collection = collection.to_string();
        self.blocking(move |conn| {
            let body: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT body FROM documents WHERE collection = ?1 ORDER BY seq LIMIT 1",
                    params![collection],
                    |row| row.get(0),
                )
                .optional()?;
            body.as_deref().map(decode_document).transpose()
        })
        .await
    }

    async fn get_document(&self, collection: &str, id: &ObjectId) -> Result<Option<Document>> {
        let collection = collection.to_string();
        let id = *id;
        self.blocking(move |conn| {
            let body: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT body FROM documents WHERE collection = ?1 AND doc_id = ?2",
                    params![collection, id.as_bytes().as_slice()],
                    |row| row.get(0),
                )
                .optional()?;
            body.as_deref().map(decode_document).transpose()
        })
        .await
    }

    async fn upsert_document(
        &self,
        collection: &str,
        id: &ObjectId,
        fields: &Document,
    ) -> Result<UpsertResult> {
        let collection = collection.to_string();
        let id = *id;
        let fields = fields.clone();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let result = upsert_in(&tx, &collection, &id, &fields)?;
            tx.commit()?;
            Ok(result)
        })
        .await
    }

    async fn insert_document(&self, collection: &str, mut doc: Document) -> Result<ObjectId> {
        let id = match doc.get(ID_FIELD) {
            Some(_) => document_id(&doc).map_err(|e| StoreError::InvalidData(e.to_string()))?,
            None => ObjectId::new(),
        };
        doc.insert(ID_FIELD.to_string(), Value::ObjectId(id));
        let body = encode_document(&doc)?;
        let collection = collection.to_string();

        self.blocking(move |conn| {
            let now = now_millis();
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO documents (collection, doc_id, body, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![collection, id.as_bytes().as_slice(), body, now],
            )?;
            if inserted == 0 {
                return Err(StoreError::InvalidData(format!(
                    "duplicate _id {id} in {collection}"
                )));
            }
            Ok(id)
        })
        .await
    }

    async fn delete_document(&self, collection: &str, id: &ObjectId) -> Result<bool> {
        let collection = collection.to_string();
        let id = *id;
        self.blocking(move |conn| {
            let n = conn.execute(
                "DELETE FROM documents WHERE collection = ?1 AND doc_id = ?2",
                params![collection, id.as_bytes().as_slice()],
            )?;
            Ok(n > 0)
        })
        .await
    }

    async fn count_documents(&self, collection: &str) -> Result<usize> {
        let collection = collection.to_string();
        self.blocking(move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM documents WHERE collection = ?1",
                params![collection],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
        .await
    }
}

#[async_trait]
impl RelayQueueStore for SqliteStore {
    async fn enqueue(&self, entry: NewEntry) -> Result<QueueId> {
        self.blocking(move |conn| insert_entry(conn, &entry)).await
    }

    async fn peek_oldest(&self, filter: &QueueFilter) -> Result<Option<RelayQueueEntry>> {
        let destination = destination_of(filter);
        self.blocking(move |conn| oldest_eligible(conn, now_millis(), destination.as_deref()))
            .await
    }

    async fn claim_oldest(
        &self,
        filter: &QueueFilter,
        lease: Duration,
    ) -> Result<Option<RelayQueueEntry>> {
        let destination = destination_of(filter);
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let now = now_millis();

            let Some(mut entry) = oldest_eligible(&tx, now, destination.as_deref())? else {
                return Ok(None);
            };

            let until = now + lease.as_millis() as i64;
            tx.execute(
                "UPDATE relay_queue SET claimed_until = ?2 WHERE queue_id = ?1",
                params![entry.queue_id.get() as i64, until],
            )?;
            tx.commit()?;

            entry.claimed_until = Some(until);
            Ok(Some(entry))
        })
        .await
    }

    async fn release_claim(&self, id: QueueId) -> Result<()> {
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE relay_queue SET claimed_until = NULL WHERE queue_id = ?1",
                params![id.get() as i64],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_entry(&self, id: QueueId) -> Result<bool> {
        self.blocking(move |conn| {
            let n = conn.execute(
                "DELETE FROM relay_queue WHERE queue_id = ?1",
                params![id.get() as i64],
            )?;
            Ok(n > 0)
        })
        .await
    }

    async fn mark_error(
        &self,
        id: QueueId,
        message: &str,
        policy: &RetryPolicy,
    ) -> Result<Option<EntryStatus>> {
        let message = message.to_string();
        let policy = policy.clone();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let sql = format!("SELECT {ENTRY_COLUMNS} FROM relay_queue WHERE queue_id = ?1");
            let Some(mut entry) = tx
                .query_row(&sql, params![id.get() as i64], row_to_entry)
                .optional()?
            else {
                return Ok(None);
            };

            let status = entry.record_failure(&message, &policy, now_millis());
            tx.execute(
                "UPDATE relay_queue SET
                    error = ?2, error_message = ?3, attempts = ?4, retry_at = ?5,
                    dead_letter = ?6, claimed_until = NULL
                 WHERE queue_id = ?1",
                params![
                    id.get() as i64,
                    entry.error,
                    entry.error_message,
                    entry.attempts,
                    entry.retry_at,
                    entry.dead_letter,
                ],
            )?;
            tx.commit()?;
            Ok(Some(status))
        })
        .await
    }

    async fn requeue_entry(&self, id: QueueId) -> Result<bool> {
        self.blocking(move |conn| {
            let n = conn.execute(
                "UPDATE relay_queue SET
                    error = 0, error_message = NULL, attempts = 0, retry_at = NULL,
                    dead_letter = 0, claimed_until = NULL
                 WHERE queue_id = ?1",
                params![id.get() as i64],
            )?;
            Ok(n > 0)
        })
        .await
    }

    async fn get_entry(&self, id: QueueId) -> Result<Option<RelayQueueEntry>> {
        self.blocking(move |conn| {
            let sql = format!("SELECT {ENTRY_COLUMNS} FROM relay_queue WHERE queue_id = ?1");
            conn.query_row(&sql, params![id.get() as i64], row_to_entry)
                .optional()
                .map_err(StoreError::from)
        })
        .await
    }

    async fn list_entries(&self, filter: &QueueFilter) -> Result<Vec<RelayQueueEntry>> {
        let destination = destination_of(filter);
        self.blocking(move |conn| {
            select_entries(
                conn,
                "(?1 IS NULL OR destination_location = ?1)",
                params![destination],
            )
        })
        .await
    }

    async fn dead_letters(&self, filter: &QueueFilter) -> Result<Vec<RelayQueueEntry>> {
        let destination = destination_of(filter);
        self.blocking(move |conn| {
            select_entries(
                conn,
                "dead_letter = 1 AND (?1 IS NULL OR destination_location = ?1)",
                params![destination],
            )
        })
        .await
    }

    async fn queue_len(&self, filter: &QueueFilter) -> Result<usize> {
        let destination = destination_of(filter);
        self.blocking(move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM relay_queue WHERE (?1 IS NULL OR destination_location = ?1)",
                params![destination],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
        .await
    }
}

#[async_trait]
impl RelayStore for SqliteStore {
    async fn upsert_and_enqueue(
        &self,
        collection: &str,
        id: &ObjectId,
        fields: &Document,
        entries: Vec<NewEntry>,
    ) -> Result<(UpsertResult, Vec<QueueId>)> {
        let collection = collection.to_string();
        let id = *id;
        let fields = fields.clone();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let outcome = upsert_in(&tx, &collection, &id, &fields)?;
            let ids = entries
                .iter()
                .map(|entry| insert_entry(&tx, entry))
                .collect::<Result<Vec<_>>>()?;
            tx.commit()?;
            Ok((outcome, ids))
        })
        .await
    }
}
