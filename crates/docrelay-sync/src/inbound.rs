//! Hub-side pump: pushes a registered peer's pending entries to it.
//!
//! One pump runs per registered connection, filtered on the location the
//! peer declared. Entries go out as `server-sync`; the peer answers with
//! `server-ack`.

use std::sync::Arc;

use docrelay_core::{IdentifierCodec, RelayQueueEntry};
use docrelay_store::{QueueFilter, RelayQueueStore};

use crate::error::Result;
use crate::messages::{RelayMessage, ServerSync};
use crate::pump::{AckReceiver, DrainLoop, PumpConfig, PumpReport, QueueSignal};
use crate::session::Session;
use crate::transport::SharedTransport;

/// Drains the entries addressed to one session's location.
pub struct InboundSyncPump<Q: ?Sized> {
    store: Arc<Q>,
    codec: IdentifierCodec,
    config: PumpConfig,
    signal: QueueSignal,
    session: Arc<Session>,
}

impl<Q: RelayQueueStore + ?Sized> InboundSyncPump<Q> {
    /// Create a pump for `session`.
    ///
    /// Fails with [`SyncError::NotRegistered`](crate::SyncError::NotRegistered)
    /// until the session has registered a location.
    pub fn new(
        store: Arc<Q>,
        codec: IdentifierCodec,
        config: PumpConfig,
        signal: QueueSignal,
        session: Arc<Session>,
    ) -> Result<Self> {
        session.require_location()?;
        Ok(Self {
            store,
            codec,
            config,
            signal,
            session,
        })
    }

    /// The session this pump delivers to.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Run over the session's connection until it closes.
    ///
    /// `acks` carries the peer's `server-ack` replies.
    pub async fn run(&self, transport: SharedTransport, mut acks: AckReceiver) -> PumpReport {
        let filter = match self.session.location() {
            Some(location) => QueueFilter::Destination(location.clone()),
            None => return PumpReport::default(),
        };
        let drain = DrainLoop {
            store: &*self.store,
            transport: &*transport,
            config: &self.config,
            signal: &self.signal,
            filter,
            direction: "inbound",
        };
        drain.run(&mut acks, |entry| self.envelope(entry)).await
    }

    fn envelope(&self, entry: &RelayQueueEntry) -> Result<RelayMessage> {
        Ok(RelayMessage::ServerSync(ServerSync {
            queue_id: entry.queue_id,
            collection: entry.collection.clone(),
            document: self.codec.encode_document(&entry.document)?,
            origin_location: entry.origin_location.clone(),
            timestamp: entry.timestamp,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use docrelay_core::{Document, NewEntry, ObjectId, RetryPolicy, Value, ID_FIELD};
    use docrelay_store::{DocumentStore, MemoryStore};
    use serde_json::json;

    use crate::apply::handle_server_sync;
    use crate::error::SyncError;
    use crate::messages::PROTOCOL_VERSION;
    use crate::pump::{ack_channel, AckReply};
    use crate::session::ConnectionId;
    use crate::transport::memory::MemoryTransport;
    use crate::transport::Transport;

    const HEX: &str = "507f191e810c19729de860ea";

    fn config() -> PumpConfig {
        PumpConfig {
            poll_interval: Duration::from_millis(20),
            ack_timeout: Duration::from_millis(500),
            claim_lease: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }

    fn registered(location: &str) -> Arc<Session> {
        let session = Arc::new(Session::new(ConnectionId(1), "peer"));
        session.register(location.into(), PROTOCOL_VERSION).unwrap();
        session
    }

    #[test]
    fn test_requires_registration() {
        let session = Arc::new(Session::new(ConnectionId(1), "peer"));
        let result = InboundSyncPump::new(
            Arc::new(MemoryStore::new()),
            IdentifierCodec::default(),
            config(),
            QueueSignal::new(),
            session,
        );
        assert!(matches!(result, Err(SyncError::NotRegistered)));
    }

    #[tokio::test]
    async fn test_pushes_only_own_location() {
        let hub_store = Arc::new(MemoryStore::new());
        let id = ObjectId::from_hex(HEX).unwrap();
        let mut doc = Document::new();
        doc.insert(ID_FIELD.into(), Value::ObjectId(id));
        doc.insert("name".into(), "x".into());

        hub_store
            .enqueue(NewEntry::new("sites", doc.clone(), "C".into(), "B".into(), 1))
            .await
            .unwrap();
        let for_a = hub_store
            .enqueue(NewEntry::new("sites", doc, "C".into(), "A".into(), 2))
            .await
            .unwrap();

        let (hub_end, peer_end) = MemoryTransport::pair("A", "hub");
        let (ack_tx, ack_rx) = ack_channel();
        let pump = InboundSyncPump::new(
            Arc::clone(&hub_store),
            IdentifierCodec::default(),
            config(),
            QueueSignal::new(),
            registered("A"),
        )
        .unwrap();
        let task = tokio::spawn(async move { pump.run(Arc::new(hub_end), ack_rx).await });

        // Play the peer: apply and answer.
        let peer_store = MemoryStore::new();
        let Some(RelayMessage::ServerSync(push)) = peer_end.recv().await.unwrap() else {
            panic!("expected server-sync");
        };
        assert_eq!(push.queue_id, for_a);
        assert_eq!(push.document, json!({"_id": {"$oid": HEX}, "name": "x"}));

        let reply = handle_server_sync(&peer_store, &IdentifierCodec::default(), &push).await;
        let RelayMessage::ServerAck {
            status,
            queue_id,
            error,
        } = reply
        else {
            panic!("expected server-ack");
        };
        ack_tx
            .send(AckReply::from_wire(queue_id, status, error))
            .await
            .unwrap();

        let filter = QueueFilter::destination("A");
        for _ in 0..50 {
            if hub_store.queue_len(&filter).await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(ack_tx);
        let report = task.await.unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(hub_store.queue_len(&filter).await.unwrap(), 0);
        assert_eq!(
            hub_store.queue_len(&QueueFilter::destination("B")).await.unwrap(),
            1
        );
        let applied = peer_store.get_document("sites", &id).await.unwrap().unwrap();
        assert_eq!(applied["name"], Value::from("x"));
    }

    #[tokio::test]
    async fn test_stale_ack_is_ignored() {
        let hub_store = Arc::new(MemoryStore::new());
        let mut doc = Document::new();
        doc.insert(ID_FIELD.into(), Value::ObjectId(ObjectId::new()));
        let id = hub_store
            .enqueue(NewEntry::new("sites", doc, "C".into(), "A".into(), 1))
            .await
            .unwrap();

        let (hub_end, peer_end) = MemoryTransport::pair("A", "hub");
        let (ack_tx, ack_rx) = ack_channel();
        let pump = InboundSyncPump::new(
            Arc::clone(&hub_store),
            IdentifierCodec::default(),
            config(),
            QueueSignal::new(),
            registered("A"),
        )
        .unwrap();
        let task = tokio::spawn(async move { pump.run(Arc::new(hub_end), ack_rx).await });

        let Some(RelayMessage::ServerSync(push)) = peer_end.recv().await.unwrap() else {
            panic!("expected server-sync");
        };
        ack_tx
            .send(AckReply::from_wire(
                docrelay_core::QueueId(push.queue_id.get() + 100),
                crate::messages::AckStatus::Received,
                None,
            ))
            .await
            .unwrap();
        ack_tx
            .send(AckReply::from_wire(
                push.queue_id,
                crate::messages::AckStatus::Received,
                None,
            ))
            .await
            .unwrap();

        for _ in 0..50 {
            if hub_store.get_entry(id).await.unwrap().is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(ack_tx);
        let report = task.await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.stale_acks, 1);
    }
}
