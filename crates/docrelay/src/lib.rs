//! # docrelay
//!
//! Hub-and-peer document replication with a durable relay queue.
//!
//! ## Overview
//!
//! Peers write to their own store and queue every write for the hub. The
//! hub applies what it receives, then queues a copy for every other
//! interested location and pushes those copies as peers connect. Nothing
//! leaves a queue until the receiving side acknowledged applying it, and
//! applying is an idempotent upsert keyed by `_id`, so connections can
//! drop at any point without losing or doubling a write.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use docrelay::{Hub, HubConfig, Peer, PeerConfig};
//! use docrelay::sync::{TcpAcceptor, TcpConnector};
//!
//! async fn example() -> docrelay::Result<()> {
//!     let hub = Hub::open(&HubConfig::default())?;
//!     let acceptor = TcpAcceptor::bind("127.0.0.1:7700").await?;
//!     tokio::spawn(async move { hub.serve_until_ctrl_c(&acceptor).await });
//!
//!     let peer = Peer::open(&PeerConfig::new("A"))?;
//!     // peer.write("sites", doc).await?;
//!     peer.run(&TcpConnector::new("127.0.0.1:7700"), std::future::pending()).await
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `docrelay::core` - identifiers, documents, queue entries, codec
//! - `docrelay::store` - document and relay queue stores
//! - `docrelay::sync` - wire protocol, pumps and fan-out

use std::path::Path;

pub mod config;
pub mod error;
pub mod hub;
pub mod peer;

pub use docrelay_core as core;
pub use docrelay_store as store;
pub use docrelay_sync as sync;

pub use config::{HubConfig, PeerConfig, DEFAULT_HUB_LOCATION, MEMORY_DB};
pub use error::{RelayError, Result};
pub use hub::{ConnectionReport, Hub};
pub use peer::{Peer, SessionReport};

pub use docrelay_core::{Document, IdentifierCodec, Location, ObjectId, Value};

/// Open the SQLite store at `path`, or an in-memory one for [`MEMORY_DB`].
///
/// Failure here is fatal for a hub or peer process.
pub fn open_store(path: &Path) -> Result<store::SqliteStore> {
    let opened = if path == Path::new(MEMORY_DB) {
        store::SqliteStore::open_memory()
    } else {
        store::SqliteStore::open(path)
    };
    opened.map_err(|e| RelayError::Bootstrap(format!("{}: {e}", path.display())))
}
