//! # docrelay Core
//!
//! Pure primitives for docrelay: identifiers, documents, relay queue entries
//! and the identifier codec that lets structured keys survive JSON transport.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`ObjectId`] - 12-byte document identifier, 24 hex chars on the wire
//! - [`Value`] / [`Document`] - native document tree
//! - [`RelayQueueEntry`] - one pending cross-node document delivery
//! - [`IdentifierCodec`] - native tree <-> JSON conversion
//! - [`RetryPolicy`] - bounded retry with exponential backoff per entry
//!
//! ## Identifier Forms
//!
//! The codec always emits the tagged form `{"$oid": "<hex>"}`. On decode it
//! accepts the tagged form, native identifiers, and (only when
//! [`CodecConfig::legacy_hex_strings`] is set) bare 24-hex strings. See
//! [`codec`].

pub mod codec;
pub mod entry;
pub mod error;
pub mod retry;
pub mod types;
pub mod value;

pub use codec::{CodecConfig, IdentifierCodec, OID_TAG};
pub use entry::{DeliveryKey, EntryStatus, NewEntry, RelayQueueEntry};
pub use error::{CoreError, Result};
pub use retry::{FailureDisposition, RetryPolicy};
pub use types::{now_millis, Location, ObjectId, QueueId};
pub use value::{document_id, strip_id, Document, Value, ID_FIELD};
