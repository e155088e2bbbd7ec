//! The peer: writes locally, queues every write for the hub, and applies
//! what the hub pushes back.
//!
//! A peer session is `register-location`, wait for `registered`, then run
//! the outbound pump next to a reader loop until the connection drops.
//! [`Peer::run`] repeats sessions with a reconnect delay.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use docrelay_core::{
    document_id, now_millis, CoreError, Document, IdentifierCodec, Location, NewEntry, ObjectId,
    QueueId, Value, ID_FIELD,
};
use docrelay_store::{QueueFilter, RelayQueueStore, RelayStore, SqliteStore, StoreError};
use docrelay_sync::{
    ack_channel, handle_server_sync, AckReply, Connector, ErrorCode, OutboundSyncPump,
    PumpConfig, PumpReport, QueueSignal, RelayMessage, SharedTransport, SyncError,
    PROTOCOL_VERSION,
};

use crate::config::PeerConfig;
use crate::error::{RelayError, Result};

/// What happened during one connected session.
#[derive(Debug, Clone, Default)]
pub struct SessionReport {
    /// `server-sync` pushes applied and answered `received`.
    pub applied: u64,
    /// `server-sync` pushes answered `error`.
    pub rejected: u64,
    /// The outbound pump's counters.
    pub outbound: PumpReport,
}

/// A replication peer over a relay store.
pub struct Peer<S: ?Sized> {
    store: Arc<S>,
    codec: IdentifierCodec,
    location: Location,
    hub_location: Location,
    pump: PumpConfig,
    signal: QueueSignal,
    reconnect_delay: Duration,
    max_reconnect_attempts: Option<u32>,
}

impl<S: ?Sized> Clone for Peer<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            codec: self.codec.clone(),
            location: self.location.clone(),
            hub_location: self.hub_location.clone(),
            pump: self.pump.clone(),
            signal: self.signal.clone(),
            reconnect_delay: self.reconnect_delay,
            max_reconnect_attempts: self.max_reconnect_attempts,
        }
    }
}

impl Peer<SqliteStore> {
    /// Open the configured SQLite store and build a peer over it.
    pub fn open(config: &PeerConfig) -> Result<Self> {
        let store = crate::open_store(&config.db_path)?;
        Ok(Self::new(Arc::new(store), config))
    }
}

impl<S: RelayStore + 'static> Peer<S> {
    pub fn new(store: Arc<S>, config: &PeerConfig) -> Self {
        Self {
            store,
            codec: IdentifierCodec::new(config.codec.clone()),
            location: config.location.clone(),
            hub_location: config.hub_location.clone(),
            pump: config.pump.clone(),
            signal: QueueSignal::new(),
            reconnect_delay: config.reconnect_delay,
            max_reconnect_attempts: config.max_reconnect_attempts,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn codec(&self) -> &IdentifierCodec {
        &self.codec
    }

    /// Entries not yet acknowledged by the hub.
    pub async fn pending(&self) -> Result<usize> {
        Ok(self.store.queue_len(&QueueFilter::Any).await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Local writes
    // ─────────────────────────────────────────────────────────────────────────

    /// Upsert `document` into `collection` and queue it for the hub.
    ///
    /// An `_id` is minted when the document has none. Only the fields
    /// present are written, locally and at every other location. The local
    /// change and its queue entry commit together.
    pub async fn write(&self, collection: &str, mut document: Document) -> Result<(ObjectId, QueueId)> {
        if collection.is_empty() {
            return Err(RelayError::Sync(SyncError::Apply(
                "collection name is empty".into(),
            )));
        }
        let id = match document_id(&document) {
            Ok(id) => id,
            Err(CoreError::MissingId) => ObjectId::new(),
            Err(error) => return Err(error.into()),
        };
        // Canonical native form, so the queued copy encodes as `$oid`.
        document.insert(ID_FIELD.to_string(), Value::ObjectId(id));

        let entry = NewEntry::new(
            collection,
            document.clone(),
            self.location.clone(),
            self.hub_location.clone(),
            now_millis(),
        );
        let (_, queued) = self
            .store
            .upsert_and_enqueue(collection, &id, &document, vec![entry])
            .await?;
        let queue_id = queued
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::InvalidData("write was not queued".into()))?;
        self.signal.notify();

        debug!(collection, %id, %queue_id, "queued local write");
        Ok((id, queue_id))
    }

    /// Decode a JSON document with the peer's codec and [`write`](Self::write) it.
    pub async fn write_json(
        &self,
        collection: &str,
        document: &serde_json::Value,
    ) -> Result<(ObjectId, QueueId)> {
        let document = self.codec.decode_document(document)?;
        self.write(collection, document).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sessions
    // ─────────────────────────────────────────────────────────────────────────

    /// Register over `transport` and replicate until it closes.
    pub async fn run_session(&self, transport: SharedTransport) -> std::result::Result<SessionReport, SyncError> {
        let result = self.session(&transport).await;
        transport.close().await;
        result
    }

    async fn session(&self, transport: &SharedTransport) -> std::result::Result<SessionReport, SyncError> {
        self.register(transport).await?;
        info!(location = %self.location, remote = transport.label(), "registered with hub");

        let (acks, ack_rx) = ack_channel();
        let pump = OutboundSyncPump::new(
            Arc::clone(&self.store),
            self.codec.clone(),
            self.pump.clone(),
            self.signal.clone(),
        );
        let pump_transport = Arc::clone(transport);
        let pump_task = tokio::spawn(async move { pump.run(pump_transport, ack_rx).await });

        let mut report = SessionReport::default();
        loop {
            let message = match transport.recv().await {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(SyncError::InvalidMessage(reason)) => {
                    warn!(%reason, "unparseable message from hub");
                    continue;
                }
                Err(error) => {
                    debug!(%error, "receive failed");
                    break;
                }
            };

            match message {
                RelayMessage::ServerSync(push) => {
                    let reply = handle_server_sync(&*self.store, &self.codec, &push).await;
                    if matches!(reply, RelayMessage::ServerAck { status, .. } if status.is_success()) {
                        report.applied += 1;
                    } else {
                        report.rejected += 1;
                    }
                    if transport.send(reply).await.is_err() {
                        break;
                    }
                }
                RelayMessage::Ack {
                    status,
                    queue_id,
                    error,
                } => {
                    if acks.send(AckReply::from_wire(queue_id, status, error)).await.is_err() {
                        debug!(%queue_id, "pump gone, ack dropped");
                    }
                }
                RelayMessage::Error { code, message } => {
                    warn!(?code, %message, "hub reported error");
                }
                other => debug!(event = other.event(), "ignoring unexpected event"),
            }
        }

        drop(acks);
        report.outbound = match pump_task.await {
            Ok(outbound) => outbound,
            Err(error) => {
                warn!(%error, "outbound pump failed");
                PumpReport::default()
            }
        };
        Ok(report)
    }

    async fn register(&self, transport: &SharedTransport) -> std::result::Result<(), SyncError> {
        transport
            .send(RelayMessage::RegisterLocation {
                location: self.location.clone(),
                protocol_version: PROTOCOL_VERSION,
            })
            .await?;

        let deadline = tokio::time::Instant::now() + self.pump.ack_timeout;
        loop {
            let received = tokio::time::timeout_at(deadline, transport.recv())
                .await
                .map_err(|_| SyncError::Timeout("registration".into()))??;
            match received {
                Some(RelayMessage::Registered { location }) if location == self.location => {
                    return Ok(())
                }
                Some(RelayMessage::Error { code, message }) => {
                    return Err(SyncError::Peer { code, message })
                }
                Some(other) => debug!(event = other.event(), "ignored before registration"),
                None => return Err(SyncError::Disconnected),
            }
        }
    }

    /// Connect, replicate, and reconnect until `shutdown` resolves.
    ///
    /// Gives up after `max_reconnect_attempts` consecutive failures, or at
    /// once if the hub rejects the registration.
    pub async fn run<C, F>(&self, connector: &C, shutdown: F) -> Result<()>
    where
        C: Connector + ?Sized,
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        let mut failures: u32 = 0;

        loop {
            let attempt = async {
                let transport = connector.connect().await?;
                self.run_session(transport).await
            };
            let outcome = tokio::select! {
                _ = &mut shutdown => return Ok(()),
                outcome = attempt => outcome,
            };

            match outcome {
                Ok(report) => {
                    failures = 0;
                    info!(
                        location = %self.location,
                        delivered = report.outbound.delivered,
                        applied = report.applied,
                        "disconnected from hub"
                    );
                }
                Err(SyncError::Peer { code, message })
                    if matches!(code, ErrorCode::VersionMismatch | ErrorCode::AlreadyRegistered) =>
                {
                    return Err(RelayError::Rejected {
                        location: self.location.clone(),
                        code,
                        message,
                    });
                }
                Err(error) => {
                    failures += 1;
                    warn!(location = %self.location, attempt = failures, %error, "connection failed");
                    if let Some(max) = self.max_reconnect_attempts {
                        if failures >= max {
                            return Err(RelayError::ReconnectExhausted { attempts: failures });
                        }
                    }
                }
            }

            tokio::select! {
                _ = &mut shutdown => return Ok(()),
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
    }
}
