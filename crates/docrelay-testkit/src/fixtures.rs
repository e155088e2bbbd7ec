//! Test fixtures and helpers.
//!
//! Sample documents plus [`RelayHarness`], a hub and peers wired together
//! over an in-memory network. Harness helpers panic on timeout; they are
//! meant for tests only.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use docrelay::{Hub, HubConfig, Peer, PeerConfig};
use docrelay_core::{Document, Location, ObjectId, RetryPolicy, Value, ID_FIELD};
use docrelay_store::{DocumentStore, MemoryStore};
use docrelay_sync::{MemoryNetwork, PumpConfig};

/// How long harness helpers wait before failing the test.
pub const WAIT: Duration = Duration::from_secs(5);

/// Pump settings that keep tests fast.
pub fn fast_pump() -> PumpConfig {
    PumpConfig {
        poll_interval: Duration::from_millis(20),
        ack_timeout: Duration::from_millis(500),
        claim_lease: Duration::from_secs(2),
        retry: RetryPolicy::default(),
    }
}

/// A `sites` document without an `_id`.
pub fn site(name: &str) -> Document {
    let mut doc = Document::new();
    doc.insert("name".into(), name.into());
    doc.insert("region".into(), "north".into());
    doc.insert("active".into(), true.into());
    doc
}

/// A `sites` document with a fixed `_id`.
pub fn site_with_id(hex: &str, name: &str) -> Document {
    let mut doc = site(name);
    if let Ok(id) = ObjectId::from_hex(hex) {
        doc.insert(ID_FIELD.into(), Value::ObjectId(id));
    }
    doc
}

/// A hub over an in-memory store and network.
pub struct RelayHarness {
    pub network: Arc<MemoryNetwork>,
    pub hub: Hub<MemoryStore>,
    pub hub_store: Arc<MemoryStore>,
    stop: Option<oneshot::Sender<()>>,
}

impl RelayHarness {
    /// Start a hub that fans out to `locations`. Needs a Tokio runtime.
    pub fn new(locations: &[&str]) -> Self {
        let config = HubConfig {
            push_locations: locations.iter().map(|l| Location::from(*l)).collect(),
            pump: fast_pump(),
            ..HubConfig::default()
        };
        let hub_store = Arc::new(MemoryStore::new());
        let hub = Hub::new(Arc::clone(&hub_store), &config);
        let network = MemoryNetwork::new();

        let (stop, stopped) = oneshot::channel::<()>();
        let serving = hub.clone();
        let acceptor = Arc::clone(&network);
        tokio::spawn(async move {
            serving
                .serve(&*acceptor, async {
                    let _ = stopped.await;
                })
                .await
        });

        Self {
            network,
            hub,
            hub_store,
            stop: Some(stop),
        }
    }

    /// Start a peer at `location` with its own store.
    pub fn peer(&self, location: &str) -> TestPeer {
        let config = PeerConfig {
            pump: fast_pump(),
            reconnect_delay: Duration::from_millis(20),
            max_reconnect_attempts: None,
            ..PeerConfig::new(location)
        };
        let store = Arc::new(MemoryStore::new());
        let peer = Peer::new(Arc::clone(&store), &config);

        let connector = self.network.connector(location);
        let (stop, stopped) = oneshot::channel::<()>();
        let running = peer.clone();
        let task = tokio::spawn(async move {
            running
                .run(&connector, async {
                    let _ = stopped.await;
                })
                .await
        });

        TestPeer {
            peer,
            store,
            stop: Some(stop),
            task,
        }
    }

    /// Wait until the hub holds nothing for `location`.
    pub async fn wait_until_drained(&self, location: &str) {
        let location = Location::from(location);
        let drained = tokio::time::timeout(WAIT, async {
            while self.hub.pending_for(&location).await.unwrap_or(usize::MAX) > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(drained.is_ok(), "hub queue for {location} never drained");
    }

    /// Wait for a document in the hub's store.
    pub async fn wait_for(&self, collection: &str, id: &ObjectId) -> Document {
        wait_for_document(&self.hub_store, collection, id).await
    }
}

impl Drop for RelayHarness {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

/// A running peer.
pub struct TestPeer {
    pub peer: Peer<MemoryStore>,
    pub store: Arc<MemoryStore>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<docrelay::Result<()>>,
}

impl TestPeer {
    /// Wait for a document in this peer's store.
    pub async fn wait_for(&self, collection: &str, id: &ObjectId) -> Document {
        wait_for_document(&self.store, collection, id).await
    }

    /// Wait until the hub acknowledged every local write.
    pub async fn wait_until_flushed(&self) {
        let flushed = tokio::time::timeout(WAIT, async {
            while self.peer.pending().await.unwrap_or(usize::MAX) > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(flushed.is_ok(), "peer {} never flushed", self.peer.location());
    }

    /// Stop the peer and return how its run ended.
    pub async fn shutdown(mut self) -> docrelay::Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match (&mut self.task).await {
            Ok(result) => result,
            Err(error) => panic!("peer task failed: {error}"),
        }
    }
}

impl Drop for TestPeer {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

async fn wait_for_document(store: &MemoryStore, collection: &str, id: &ObjectId) -> Document {
    let found = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(Some(doc)) = store.get_document(collection, id).await {
                return doc;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    match found {
        Ok(doc) => doc,
        Err(_) => panic!("{collection}/{id} never arrived"),
    }
}
