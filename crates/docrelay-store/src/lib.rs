//! # docrelay Store
//!
//! Storage abstraction for docrelay. Two traits, each with SQLite and
//! in-memory implementations:
//!
//! - [`DocumentStore`] - the collections being replicated
//! - [`RelayQueueStore`] - the durable backlog of pending deliveries
//!
//! [`RelayStore`] joins the two and commits a document change together
//! with the queue entries that replicate it.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use docrelay_core::{Location, NewEntry, now_millis};
//! use docrelay_store::{QueueFilter, RelayQueueStore, SqliteStore};
//! use std::time::Duration;
//!
//! async fn example() {
//!     let store = SqliteStore::open("relay.db").unwrap();
//!
//!     // let entry = NewEntry::new("sites", doc, "A".into(), "B".into(), now_millis());
//!     // let id = store.enqueue(entry).await.unwrap();
//!
//!     let filter = QueueFilter::destination("B");
//!     if let Some(entry) = store.claim_oldest(&filter, Duration::from_secs(30)).await.unwrap() {
//!         // deliver, then
//!         store.delete_entry(entry.queue_id).await.unwrap();
//!     }
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Atomic claim**: `claim_oldest` picks and leases the oldest eligible
//!   entry in one step, so two pumps on one destination never both get it
//! - **Idempotent delete**: deleting a missing entry is not an error
//! - **Field-set upsert**: `upsert_document` overwrites only the given
//!   fields and never writes `_id`
//! - **FIFO**: queue ids ascend and are never reused
//! - **Per-document order**: a newer write of a document waits while an
//!   older one for the same destination is still queued

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{
    merge_fields, DocumentStore, QueueFilter, RelayQueueStore, RelayStore, UpsertResult,
};
