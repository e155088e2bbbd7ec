//! # docrelay Sync
//!
//! Replication protocol between one hub and many peers.
//!
//! ## Overview
//!
//! Every write is queued before it is sent, and a queue entry is deleted
//! only after the receiving side confirmed applying it. Applying is an
//! upsert keyed by `_id`, so redelivering after a lost ack is harmless and
//! delivery is at-least-once with exactly-once effect.
//!
//! - [`OutboundSyncPump`] drains a peer's queue to the hub
//! - [`FanoutRouter`] applies what the hub receives and queues copies for
//!   the other locations
//! - [`InboundSyncPump`] drains the hub's queue for one registered peer
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use docrelay_core::IdentifierCodec;
//! use docrelay_store::MemoryStore;
//! use docrelay_sync::{ack_channel, OutboundSyncPump, PumpConfig, QueueSignal, SharedTransport};
//!
//! async fn example(transport: SharedTransport) {
//!     let store = Arc::new(MemoryStore::new());
//!     let pump = OutboundSyncPump::new(
//!         store,
//!         IdentifierCodec::default(),
//!         PumpConfig::default(),
//!         QueueSignal::new(),
//!     );
//!
//!     // The connection's reader loop feeds `acks` from incoming `ack` events.
//!     let (_acks_tx, acks) = ack_channel();
//!     let report = pump.run(transport, acks).await;
//!     println!("delivered {}", report.delivered);
//! }
//! ```
//!
//! ## Message Flow
//!
//! ```text
//! Peer A                              Hub
//!   |-------- register-location ------>|
//!   |<------- registered --------------|
//!   |-------- sync-data -------------->|  apply, fan out
//!   |<------- ack ---------------------|
//!   |<------- server-sync -------------|  entry for A
//!   |-------- server-ack ------------->|  delete entry
//! ```

pub mod apply;
pub mod error;
pub mod inbound;
pub mod messages;
pub mod outbound;
pub mod pump;
pub mod router;
pub mod session;
pub mod transport;

pub use apply::{apply_document, apply_payload, decode_payload, handle_server_sync, Applied};
pub use error::{Result, SyncError};
pub use inbound::InboundSyncPump;
pub use messages::{AckStatus, ErrorCode, RelayMessage, ServerSync, SyncData, PROTOCOL_VERSION};
pub use outbound::OutboundSyncPump;
pub use pump::{
    ack_channel, AckOutcome, AckReceiver, AckReply, AckSender, PumpConfig, PumpReport,
    QueueSignal,
};
pub use router::{FanoutRouter, IngestOutcome, Interest, InterestTable};
pub use session::{ConnectionId, Session, SessionRegistry};
pub use transport::{
    memory::MemoryConnector, memory::MemoryNetwork, memory::MemoryTransport, tcp::TcpAcceptor,
    tcp::TcpConnector, tcp::TcpTransport, Acceptor, Connector, SharedTransport, Transport,
};
