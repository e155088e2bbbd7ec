//! Peer-side pump: drains the peer's queue toward the hub.
//!
//! Every local mutation is queued before it is sent. The pump sends the
//! oldest entry as `sync-data` and deletes it once the hub acks `saved`;
//! an `error` ack defers the entry under the retry policy.

use std::sync::Arc;

use docrelay_core::{IdentifierCodec, RelayQueueEntry};
use docrelay_store::{QueueFilter, RelayQueueStore};

use crate::error::Result;
use crate::messages::{RelayMessage, SyncData};
use crate::pump::{AckReceiver, DrainLoop, PumpConfig, PumpReport, QueueSignal};
use crate::transport::SharedTransport;

/// Drains every queued entry of a peer, one at a time, to the hub.
pub struct OutboundSyncPump<Q: ?Sized> {
    store: Arc<Q>,
    codec: IdentifierCodec,
    config: PumpConfig,
    signal: QueueSignal,
}

impl<Q: RelayQueueStore + ?Sized> OutboundSyncPump<Q> {
    pub fn new(
        store: Arc<Q>,
        codec: IdentifierCodec,
        config: PumpConfig,
        signal: QueueSignal,
    ) -> Self {
        Self {
            store,
            codec,
            config,
            signal,
        }
    }

    /// Run over one connection until it closes.
    ///
    /// `acks` carries the hub's `ack` replies, fed by the connection's
    /// reader loop.
    pub async fn run(&self, transport: SharedTransport, mut acks: AckReceiver) -> PumpReport {
        let drain = DrainLoop {
            store: &*self.store,
            transport: &*transport,
            config: &self.config,
            signal: &self.signal,
            filter: QueueFilter::Any,
            direction: "outbound",
        };
        drain.run(&mut acks, |entry| self.envelope(entry)).await
    }

    fn envelope(&self, entry: &RelayQueueEntry) -> Result<RelayMessage> {
        Ok(RelayMessage::SyncData(SyncData {
            collection: entry.collection.clone(),
            document: self.codec.encode_document(&entry.document)?,
            queue_id: entry.queue_id,
            origin_location: entry.origin_location.clone(),
            destination_location: entry.destination_location.clone(),
            timestamp: entry.timestamp,
        }))
    }
}
