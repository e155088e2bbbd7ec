//! End-to-end replication between a hub and peers.
//!
//! Most tests run over the in-memory network. Where a test needs precise
//! control over what the peer sends, it speaks the wire protocol directly
//! through a raw transport instead of running a [`Peer`].

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use docrelay::core::{
    Document, IdentifierCodec, Location, NewEntry, ObjectId, QueueId, RetryPolicy, Value, ID_FIELD,
};
use docrelay::store::{DocumentStore, MemoryStore, QueueFilter, RelayQueueStore, SqliteStore};
use docrelay::sync::{
    handle_server_sync, AckStatus, ErrorCode, MemoryNetwork, MemoryTransport, PumpConfig,
    RelayMessage, ServerSync, SyncData, TcpAcceptor, TcpConnector, Transport, PROTOCOL_VERSION,
};
use docrelay::{Hub, HubConfig, Peer, PeerConfig, RelayError};

const HEX: &str = "507f191e810c19729de860ea";
const WAIT: Duration = Duration::from_secs(5);

fn fast_pump() -> PumpConfig {
    PumpConfig {
        poll_interval: Duration::from_millis(20),
        ack_timeout: Duration::from_millis(500),
        claim_lease: Duration::from_secs(2),
        retry: RetryPolicy::default(),
    }
}

fn hub_config(push: &[&str]) -> HubConfig {
    HubConfig {
        push_locations: push.iter().map(|l| Location::from(*l)).collect(),
        pump: fast_pump(),
        ..HubConfig::default()
    }
}

fn peer_config(location: &str) -> PeerConfig {
    PeerConfig {
        pump: fast_pump(),
        reconnect_delay: Duration::from_millis(20),
        max_reconnect_attempts: None,
        ..PeerConfig::new(location)
    }
}

fn doc(fields: &[(&str, Value)]) -> Document {
    fields
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn start_hub(hub: Hub<MemoryStore>, network: Arc<MemoryNetwork>) -> oneshot::Sender<()> {
    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(async move {
        hub.serve(&*network, async {
            let _ = stopped.await;
        })
        .await
    });
    stop
}

fn start_peer(
    peer: Peer<MemoryStore>,
    network: &Arc<MemoryNetwork>,
) -> (oneshot::Sender<()>, JoinHandle<docrelay::Result<()>>) {
    let connector = network.connector(peer.location().as_str());
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        peer.run(&connector, async {
            let _ = stopped.await;
        })
        .await
    });
    (stop, task)
}

async fn drained(hub: &Hub<MemoryStore>, location: &str) {
    let location = Location::from(location);
    tokio::time::timeout(WAIT, async {
        while hub.pending_for(&location).await.unwrap() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("queue never drained");
}

async fn arrived(store: &MemoryStore, collection: &str, id: &ObjectId) -> Document {
    tokio::time::timeout(WAIT, async {
        loop {
            if let Some(found) = store.get_document(collection, id).await.unwrap() {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("document never arrived")
}

async fn next(transport: &MemoryTransport) -> RelayMessage {
    tokio::time::timeout(WAIT, transport.recv())
        .await
        .expect("timed out waiting for a message")
        .unwrap()
        .expect("connection closed")
}

async fn raw_register(network: &MemoryNetwork, location: &str) -> MemoryTransport {
    let transport = network.connect(location).await.unwrap();
    transport
        .send(RelayMessage::RegisterLocation {
            location: location.into(),
            protocol_version: PROTOCOL_VERSION,
        })
        .await
        .unwrap();
    assert_eq!(
        next(&transport).await,
        RelayMessage::Registered {
            location: location.into()
        }
    );
    transport
}

async fn expect_push(transport: &MemoryTransport) -> ServerSync {
    match next(transport).await {
        RelayMessage::ServerSync(push) => push,
        other => panic!("expected server-sync, got {other:?}"),
    }
}

#[tokio::test]
async fn test_pending_entry_reaches_registered_peer() {
    let hub_store = Arc::new(MemoryStore::new());
    hub_store
        .enqueue(NewEntry::new(
            "sites",
            doc(&[(ID_FIELD, HEX.into()), ("name", "x".into())]),
            "B".into(),
            "A".into(),
            1,
        ))
        .await
        .unwrap();

    let network = MemoryNetwork::new();
    let hub = Hub::new(Arc::clone(&hub_store), &hub_config(&["A", "B"]));
    let _stop_hub = start_hub(hub.clone(), Arc::clone(&network));

    let peer_store = Arc::new(MemoryStore::new());
    let peer = Peer::new(Arc::clone(&peer_store), &peer_config("A"));
    let (_stop_peer, _task) = start_peer(peer, &network);

    let id = ObjectId::from_hex(HEX).unwrap();
    let applied = arrived(&peer_store, "sites", &id).await;
    assert_eq!(applied["name"], Value::from("x"));
    assert_eq!(applied[ID_FIELD], Value::ObjectId(id));
    drained(&hub, "A").await;
}

#[tokio::test]
async fn test_partial_update_keeps_unrelated_fields() {
    let hub_store = Arc::new(MemoryStore::new());
    let id = ObjectId::from_hex(HEX).unwrap();
    hub_store
        .upsert_document(
            "sites",
            &id,
            &doc(&[("name", "old".into()), ("region", "north".into())]),
        )
        .await
        .unwrap();

    let network = MemoryNetwork::new();
    let hub = Hub::new(Arc::clone(&hub_store), &hub_config(&["A", "B"]));
    let _stop_hub = start_hub(hub.clone(), Arc::clone(&network));

    let peer = Peer::new(Arc::new(MemoryStore::new()), &peer_config("A"));
    peer.write("sites", doc(&[(ID_FIELD, Value::ObjectId(id)), ("name", "new".into())]))
        .await
        .unwrap();
    let (_stop_peer, _task) = start_peer(peer.clone(), &network);

    tokio::time::timeout(WAIT, async {
        while peer.pending().await.unwrap() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("peer backlog never drained");

    let stored = hub_store.get_document("sites", &id).await.unwrap().unwrap();
    assert_eq!(stored["name"], Value::from("new"));
    assert_eq!(stored["region"], Value::from("north"));
    assert_eq!(hub.pending_for(&"B".into()).await.unwrap(), 1);
}

#[tokio::test]
async fn test_write_fans_out_without_echo() {
    let hub_store = Arc::new(MemoryStore::new());
    let network = MemoryNetwork::new();
    let hub = Hub::new(Arc::clone(&hub_store), &hub_config(&["A", "B", "C"]));
    let _stop_hub = start_hub(hub.clone(), Arc::clone(&network));

    let store_a = Arc::new(MemoryStore::new());
    let store_b = Arc::new(MemoryStore::new());
    let peer_a = Peer::new(Arc::clone(&store_a), &peer_config("A"));
    let peer_b = Peer::new(Arc::clone(&store_b), &peer_config("B"));
    let (_stop_a, _task_a) = start_peer(peer_a.clone(), &network);
    let (_stop_b, _task_b) = start_peer(peer_b, &network);

    let (id, _) = peer_a
        .write("sites", doc(&[("name", "x".into())]))
        .await
        .unwrap();

    let at_b = arrived(&store_b, "sites", &id).await;
    assert_eq!(at_b["name"], Value::from("x"));

    // C never connected; its copy waits. A never gets its own write back.
    assert_eq!(hub.pending_for(&"C".into()).await.unwrap(), 1);
    assert_eq!(hub.pending_for(&"A".into()).await.unwrap(), 0);
    let entry = hub_store
        .peek_oldest(&QueueFilter::destination("C"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.origin_location, Location::from("A"));
}

#[tokio::test]
async fn test_delivery_is_fifo_per_destination() {
    let hub_store = Arc::new(MemoryStore::new());
    for (name, destination) in [("e1", "A"), ("x", "B"), ("e2", "A"), ("y", "B"), ("e3", "A")] {
        hub_store
            .enqueue(NewEntry::new(
                "sites",
                doc(&[(ID_FIELD, ObjectId::new().into()), ("name", name.into())]),
                "C".into(),
                destination.into(),
                1,
            ))
            .await
            .unwrap();
    }

    let network = MemoryNetwork::new();
    let hub = Hub::new(Arc::clone(&hub_store), &hub_config(&["A", "B", "C"]));
    let _stop_hub = start_hub(hub.clone(), Arc::clone(&network));

    let peer = raw_register(&network, "A").await;
    let mut names = Vec::new();
    for _ in 0..3 {
        let push = expect_push(&peer).await;
        names.push(push.document["name"].as_str().unwrap().to_string());
        peer.send(RelayMessage::received(push.queue_id)).await.unwrap();
    }
    assert_eq!(names, ["e1", "e2", "e3"]);

    drained(&hub, "A").await;
    assert_eq!(hub.pending_for(&"B".into()).await.unwrap(), 2);
}

#[tokio::test]
async fn test_unacked_entry_is_redelivered_after_reconnect() {
    let hub_store = Arc::new(MemoryStore::new());
    let queued = hub_store
        .enqueue(NewEntry::new(
            "sites",
            doc(&[(ID_FIELD, HEX.into()), ("name", "x".into())]),
            "B".into(),
            "A".into(),
            1,
        ))
        .await
        .unwrap();

    let network = MemoryNetwork::new();
    let hub = Hub::new(Arc::clone(&hub_store), &hub_config(&["A", "B"]));
    let _stop_hub = start_hub(hub.clone(), Arc::clone(&network));

    let peer_store = MemoryStore::new();
    let codec = IdentifierCodec::default();

    // Apply, then drop the connection before the ack goes out.
    let first = raw_register(&network, "A").await;
    let push = expect_push(&first).await;
    assert_eq!(push.queue_id, queued);
    handle_server_sync(&peer_store, &codec, &push).await;
    first.close().await;

    let second = raw_register(&network, "A").await;
    let again = expect_push(&second).await;
    assert_eq!(again.queue_id, queued);
    assert_eq!(
        handle_server_sync(&peer_store, &codec, &again).await,
        RelayMessage::received(queued)
    );
    second
        .send(RelayMessage::received(again.queue_id))
        .await
        .unwrap();

    drained(&hub, "A").await;
    assert_eq!(peer_store.count_documents("sites").await.unwrap(), 1);
}

#[tokio::test]
async fn test_rejected_push_is_deferred_not_lost() {
    let hub_store = Arc::new(MemoryStore::new());
    let bad = hub_store
        .enqueue(NewEntry::new(
            "sites",
            doc(&[("name", "no id".into())]),
            "B".into(),
            "A".into(),
            1,
        ))
        .await
        .unwrap();
    let good = hub_store
        .enqueue(NewEntry::new(
            "sites",
            doc(&[(ID_FIELD, HEX.into())]),
            "B".into(),
            "A".into(),
            2,
        ))
        .await
        .unwrap();

    let network = MemoryNetwork::new();
    let hub = Hub::new(Arc::clone(&hub_store), &hub_config(&["A", "B"]));
    let _stop_hub = start_hub(hub.clone(), Arc::clone(&network));

    let peer_store = MemoryStore::new();
    let codec = IdentifierCodec::default();
    let peer = raw_register(&network, "A").await;

    let push = expect_push(&peer).await;
    assert_eq!(push.queue_id, bad);
    let reply = handle_server_sync(&peer_store, &codec, &push).await;
    assert!(matches!(
        reply,
        RelayMessage::ServerAck {
            status: AckStatus::Error,
            ..
        }
    ));
    peer.send(reply).await.unwrap();

    // The next entry is not held up behind the failing one.
    let push = expect_push(&peer).await;
    assert_eq!(push.queue_id, good);
    peer.send(handle_server_sync(&peer_store, &codec, &push).await)
        .await
        .unwrap();

    tokio::time::timeout(WAIT, async {
        while hub_store.get_entry(good).await.unwrap().is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("good entry never acknowledged");

    let deferred = hub_store.get_entry(bad).await.unwrap().unwrap();
    assert!(deferred.error);
    assert_eq!(deferred.attempts, 1);
    assert!(deferred.error_message.is_some());
}

#[tokio::test]
async fn test_version_mismatch_is_refused() {
    let network = MemoryNetwork::new();
    let hub = Hub::new(Arc::new(MemoryStore::new()), &hub_config(&["A"]));
    let _stop_hub = start_hub(hub, Arc::clone(&network));

    let transport = network.connect("A").await.unwrap();
    transport
        .send(RelayMessage::RegisterLocation {
            location: "A".into(),
            protocol_version: PROTOCOL_VERSION + 1,
        })
        .await
        .unwrap();

    match next(&transport).await {
        RelayMessage::Error { code, .. } => assert_eq!(code, ErrorCode::VersionMismatch),
        other => panic!("expected error, got {other:?}"),
    }
    let closed = tokio::time::timeout(WAIT, transport.recv()).await.unwrap().unwrap();
    assert_eq!(closed, None);
}

#[tokio::test]
async fn test_sync_data_before_registration_is_still_ingested() {
    let hub_store = Arc::new(MemoryStore::new());
    let network = MemoryNetwork::new();
    let hub = Hub::new(Arc::clone(&hub_store), &hub_config(&["A", "B"]));
    let _stop_hub = start_hub(hub.clone(), Arc::clone(&network));

    let transport = network.connect("A").await.unwrap();
    transport
        .send(RelayMessage::SyncData(SyncData {
            collection: "sites".into(),
            document: json!({"_id": {"$oid": HEX}, "name": "x"}),
            queue_id: QueueId(1),
            origin_location: "A".into(),
            destination_location: "hub".into(),
            timestamp: 1,
        }))
        .await
        .unwrap();
    assert_eq!(next(&transport).await, RelayMessage::saved(QueueId(1)));
    assert_eq!(hub.pending_for(&"B".into()).await.unwrap(), 1);
    assert_eq!(hub.pending_for(&"A".into()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_peer_flushes_backlog_once_hub_is_reachable() {
    let hub_store = Arc::new(MemoryStore::new());
    let network = MemoryNetwork::new();
    network.set_online(false);
    let hub = Hub::new(Arc::clone(&hub_store), &hub_config(&["A", "B"]));
    let _stop_hub = start_hub(hub, Arc::clone(&network));

    let peer = Peer::new(Arc::new(MemoryStore::new()), &peer_config("A"));
    let mut ids = Vec::new();
    for name in ["a", "b", "c"] {
        let (id, _) = peer.write("sites", doc(&[("name", name.into())])).await.unwrap();
        ids.push(id);
    }
    let (_stop_peer, _task) = start_peer(peer.clone(), &network);

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(peer.pending().await.unwrap(), 3);
    network.set_online(true);

    for id in &ids {
        arrived(&hub_store, "sites", id).await;
    }
    tokio::time::timeout(WAIT, async {
        while peer.pending().await.unwrap() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("peer backlog never drained");
}

#[tokio::test]
async fn test_peer_gives_up_after_max_attempts() {
    let network = MemoryNetwork::new();
    network.set_online(false);

    let config = PeerConfig {
        max_reconnect_attempts: Some(2),
        ..peer_config("A")
    };
    let peer = Peer::new(Arc::new(MemoryStore::new()), &config);
    let connector = network.connector("A");

    let result = tokio::time::timeout(WAIT, peer.run(&connector, std::future::pending()))
        .await
        .unwrap();
    assert!(matches!(
        result,
        Err(RelayError::ReconnectExhausted { attempts: 2 })
    ));
}

#[tokio::test]
async fn test_replication_over_tcp_with_sqlite() {
    let hub_store = Arc::new(SqliteStore::open_memory().unwrap());
    let hub = Hub::new(Arc::clone(&hub_store), &hub_config(&["A", "B"]));
    let acceptor = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
    let addr = acceptor.local_addr().unwrap().to_string();
    let (stop_hub, hub_stopped) = oneshot::channel::<()>();
    let hub_task = tokio::spawn(async move {
        hub.serve(&acceptor, async {
            let _ = hub_stopped.await;
        })
        .await
    });

    let store_a = Arc::new(SqliteStore::open_memory().unwrap());
    let store_b = Arc::new(SqliteStore::open_memory().unwrap());
    let peer_a = Peer::new(Arc::clone(&store_a), &peer_config("A"));
    let peer_b = Peer::new(Arc::clone(&store_b), &peer_config("B"));

    let mut stops = Vec::new();
    for peer in [peer_a.clone(), peer_b] {
        let connector = TcpConnector::new(addr.clone());
        let (stop, stopped) = oneshot::channel::<()>();
        stops.push(stop);
        tokio::spawn(async move {
            peer.run(&connector, async {
                let _ = stopped.await;
            })
            .await
        });
    }

    let (id, _) = peer_a
        .write_json("sites", &json!({"name": "x", "tags": ["a", "b"]}))
        .await
        .unwrap();

    let at_b = tokio::time::timeout(WAIT, async {
        loop {
            if let Some(found) = store_b.get_document("sites", &id).await.unwrap() {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("document never reached B");
    assert_eq!(at_b["name"], Value::from("x"));
    assert_eq!(
        hub_store.get_document("sites", &id).await.unwrap().unwrap()["name"],
        Value::from("x")
    );

    for stop in stops {
        let _ = stop.send(());
    }
    let _ = stop_hub.send(());
    tokio::time::timeout(WAIT, hub_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_offline_writes_survive_a_peer_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = PeerConfig {
        db_path: dir.path().join("peer.db"),
        ..peer_config("A")
    };

    let id = {
        let peer = Peer::open(&config).unwrap();
        let (id, _) = peer
            .write("sites", doc(&[("name", Value::from("x"))]))
            .await
            .unwrap();
        id
    };

    let reopened = Peer::open(&config).unwrap();
    assert_eq!(reopened.pending().await.unwrap(), 1);
    let stored = reopened.store().get_document("sites", &id).await.unwrap().unwrap();
    assert_eq!(stored["name"], Value::from("x"));

    let entry = reopened
        .store()
        .peek_oldest(&QueueFilter::Any)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.destination_location, Location::from("hub"));
    assert_eq!(entry.origin_location, Location::from("A"));
}
