//! The hub: accepts peers, ingests their writes and pushes fan-out to them.
//!
//! Each connection gets a reader loop that demultiplexes incoming events:
//!
//! - `register-location` fixes the session's location and starts the
//!   inbound pump for it
//! - `sync-data` goes to the [`FanoutRouter`] and is answered with `ack`
//! - `server-ack` is routed to the connection's inbound pump
//!
//! When the connection drops, the reader loop ends, the pump sees its ack
//! channel close and stops, and any in-flight entry stays queued for the
//! next connection of that location.

use std::future::Future;
use std::sync::Arc;

use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use docrelay_core::{IdentifierCodec, Location};
use docrelay_store::{QueueFilter, RelayQueueStore, RelayStore, SqliteStore};
use docrelay_sync::{
    ack_channel, AckReply, AckSender, Acceptor, ErrorCode, FanoutRouter, InboundSyncPump,
    Interest, InterestTable, PumpConfig, PumpReport, QueueSignal, RelayMessage, Session,
    SessionRegistry, SharedTransport, SyncError,
};

use crate::config::HubConfig;
use crate::error::Result;

/// What happened on one hub connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectionReport {
    /// Location the peer registered, if it did.
    pub location: Option<Location>,
    /// Documents received through `sync-data` and acked `saved`.
    pub ingested: u64,
    /// `sync-data` answered with an `error` ack.
    pub rejected: u64,
    /// The inbound pump's counters, if it ran.
    pub inbound: Option<PumpReport>,
}

struct RunningPump {
    acks: AckSender,
    task: JoinHandle<PumpReport>,
}

/// A replication hub over a relay store.
pub struct Hub<S: ?Sized> {
    store: Arc<S>,
    router: Arc<FanoutRouter<S>>,
    sessions: Arc<SessionRegistry>,
    codec: IdentifierCodec,
    pump: PumpConfig,
    signal: QueueSignal,
}

impl<S: ?Sized> Clone for Hub<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            router: Arc::clone(&self.router),
            sessions: Arc::clone(&self.sessions),
            codec: self.codec.clone(),
            pump: self.pump.clone(),
            signal: self.signal.clone(),
        }
    }
}

impl Hub<SqliteStore> {
    /// Open the configured SQLite store and build a hub over it.
    pub fn open(config: &HubConfig) -> Result<Self> {
        let store = crate::open_store(&config.db_path)?;
        Ok(Self::new(Arc::new(store), config))
    }
}

impl<S: RelayStore + 'static> Hub<S> {
    /// Build a hub over `store`. Every push location starts out subscribed
    /// to every collection.
    pub fn new(store: Arc<S>, config: &HubConfig) -> Self {
        let codec = IdentifierCodec::new(config.codec.clone());
        let signal = QueueSignal::new();
        let router = FanoutRouter::new(
            Arc::clone(&store),
            codec.clone(),
            config.location.clone(),
            InterestTable::broadcast(config.push_locations.iter().cloned()),
            signal.clone(),
        );
        Self {
            store,
            router: Arc::new(router),
            sessions: Arc::new(SessionRegistry::new()),
            codec,
            pump: config.pump.clone(),
            signal,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn router(&self) -> &FanoutRouter<S> {
        &self.router
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// The hub's own location.
    pub fn location(&self) -> &Location {
        self.router.local()
    }

    /// Add one collection to what `location` receives.
    pub async fn subscribe(&self, location: impl Into<Location>, collection: impl Into<String>) {
        self.router.subscribe(location.into(), collection).await;
    }

    /// Replace what `location` receives.
    pub async fn set_interest(&self, location: impl Into<Location>, interest: Interest) {
        self.router.set_interest(location.into(), interest).await;
    }

    /// Entries still waiting for `location`.
    pub async fn pending_for(&self, location: &Location) -> Result<usize> {
        Ok(self
            .store
            .queue_len(&QueueFilter::Destination(location.clone()))
            .await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Connections
    // ─────────────────────────────────────────────────────────────────────────

    /// Serve one connection until it closes.
    pub async fn handle_connection(&self, transport: SharedTransport) -> ConnectionReport {
        let session = self.sessions.open(transport.label()).await;
        info!(connection = %session.id(), remote = transport.label(), "peer connected");

        let report = self.read_loop(&session, &transport).await;

        self.sessions.close(session.id()).await;
        transport.close().await;
        info!(
            connection = %session.id(),
            location = ?report.location,
            ingested = report.ingested,
            "peer disconnected"
        );
        report
    }

    /// Serve `transport` on a task of its own.
    pub fn spawn_connection(&self, transport: SharedTransport) -> JoinHandle<ConnectionReport> {
        let hub = self.clone();
        tokio::spawn(async move { hub.handle_connection(transport).await })
    }

    /// Accept and serve connections until `shutdown` resolves or the
    /// acceptor runs dry. Open connections are dropped on return.
    pub async fn serve<A, F>(&self, acceptor: &A, shutdown: F) -> Result<()>
    where
        A: Acceptor + ?Sized,
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        let mut connections = JoinSet::new();
        info!(location = %self.location(), "hub serving");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("hub shutting down");
                    break;
                }
                accepted = acceptor.accept() => match accepted {
                    Ok(Some(transport)) => {
                        let hub = self.clone();
                        connections.spawn(async move { hub.handle_connection(transport).await });
                    }
                    Ok(None) => break,
                    Err(error) => warn!(%error, "failed to accept connection"),
                },
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(error) = finished {
                        warn!(%error, "connection task failed");
                    }
                }
            }
        }

        connections.shutdown().await;
        Ok(())
    }

    /// [`serve`](Self::serve) until Ctrl-C.
    pub async fn serve_until_ctrl_c<A>(&self, acceptor: &A) -> Result<()>
    where
        A: Acceptor + ?Sized,
    {
        self.serve(acceptor, async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                warn!(?error, "failed to install ctrl-c handler");
            }
        })
        .await
    }

    async fn read_loop(&self, session: &Arc<Session>, transport: &SharedTransport) -> ConnectionReport {
        let mut report = ConnectionReport::default();
        let mut pump: Option<RunningPump> = None;

        loop {
            let message = match transport.recv().await {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(SyncError::InvalidMessage(reason)) => {
                    warn!(connection = %session.id(), %reason, "unparseable message");
                    let reply = RelayMessage::Error {
                        code: ErrorCode::InvalidMessage,
                        message: reason,
                    };
                    if transport.send(reply).await.is_err() {
                        break;
                    }
                    continue;
                }
                Err(error) => {
                    debug!(connection = %session.id(), %error, "receive failed");
                    break;
                }
            };
            debug!(connection = %session.id(), event = message.event(), "received");

            let reply = match message {
                RelayMessage::RegisterLocation {
                    location,
                    protocol_version,
                } => match session.register(location.clone(), protocol_version) {
                    Ok(first) => {
                        if first {
                            info!(connection = %session.id(), %location, protocol_version, "peer registered");
                            report.location = Some(location.clone());
                        }
                        // Confirm before the first push can go out.
                        if transport
                            .send(RelayMessage::Registered { location })
                            .await
                            .is_err()
                        {
                            break;
                        }
                        if first {
                            pump = self.start_pump(session, transport);
                        }
                        continue;
                    }
                    Err(error @ SyncError::VersionMismatch { .. }) => {
                        warn!(connection = %session.id(), %error, "refusing peer");
                        let reply = RelayMessage::Error {
                            code: error.code(),
                            message: error.to_string(),
                        };
                        let _ = transport.send(reply).await;
                        break;
                    }
                    Err(error) => RelayMessage::Error {
                        code: error.code(),
                        message: error.to_string(),
                    },
                },
                RelayMessage::SyncData(data) => {
                    let reply = self.router.handle_sync_data(session, &data).await;
                    if matches!(reply, RelayMessage::Ack { status, .. } if status.is_success()) {
                        report.ingested += 1;
                    } else {
                        report.rejected += 1;
                    }
                    reply
                }
                RelayMessage::ServerAck {
                    status,
                    queue_id,
                    error,
                } => {
                    match &pump {
                        Some(running) => {
                            let ack = AckReply::from_wire(queue_id, status, error);
                            if running.acks.send(ack).await.is_err() {
                                debug!(connection = %session.id(), %queue_id, "pump gone, ack dropped");
                            }
                        }
                        None => {
                            debug!(connection = %session.id(), %queue_id, "server-ack before registration");
                        }
                    }
                    continue;
                }
                RelayMessage::Error { code, message } => {
                    warn!(connection = %session.id(), ?code, %message, "peer reported error");
                    continue;
                }
                other => RelayMessage::Error {
                    code: ErrorCode::InvalidMessage,
                    message: format!("unexpected {} from a peer", other.event()),
                },
            };

            if transport.send(reply).await.is_err() {
                break;
            }
        }

        if let Some(running) = pump {
            drop(running.acks);
            match running.task.await {
                Ok(pump_report) => report.inbound = Some(pump_report),
                Err(error) => warn!(connection = %session.id(), %error, "inbound pump failed"),
            }
        }
        report
    }

    fn start_pump(&self, session: &Arc<Session>, transport: &SharedTransport) -> Option<RunningPump> {
        let pump = match InboundSyncPump::new(
            Arc::clone(&self.store),
            self.codec.clone(),
            self.pump.clone(),
            self.signal.clone(),
            Arc::clone(session),
        ) {
            Ok(pump) => pump,
            Err(error) => {
                warn!(connection = %session.id(), %error, "cannot start inbound pump");
                return None;
            }
        };

        let (acks, ack_rx) = ack_channel();
        let transport = Arc::clone(transport);
        let task = tokio::spawn(async move { pump.run(transport, ack_rx).await });
        Some(RunningPump { acks, task })
    }
}
