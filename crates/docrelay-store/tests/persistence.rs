//! The relay queue survives a process restart.

use std::time::Duration;

use docrelay_core::{Document, NewEntry, ObjectId, Value, ID_FIELD};
use docrelay_store::{DocumentStore, QueueFilter, RelayQueueStore, SqliteStore};

fn site(name: &str) -> Document {
    let mut doc = Document::new();
    doc.insert(ID_FIELD.into(), Value::ObjectId(ObjectId::new()));
    doc.insert("name".into(), name.into());
    doc
}

#[tokio::test]
async fn test_queue_and_documents_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.db");

    let (first, id) = {
        let store = SqliteStore::open(&path).unwrap();
        let id = store.insert_document("sites", site("north")).await.unwrap();
        let first = store
            .enqueue(NewEntry::new("sites", site("a"), "hub".into(), "A".into(), 1))
            .await
            .unwrap();
        store
            .enqueue(NewEntry::new("sites", site("b"), "hub".into(), "A".into(), 2))
            .await
            .unwrap();

        // A claim held when the process dies must not strand the entry forever.
        store
            .claim_oldest(&QueueFilter::destination("A"), Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        (first, id)
    };

    let store = SqliteStore::open(&path).unwrap();
    assert_eq!(store.queue_len(&QueueFilter::Any).await.unwrap(), 2);
    let head = store
        .peek_oldest(&QueueFilter::destination("A"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(head.queue_id, first);
    assert_eq!(head.document["name"], Value::from("a"));

    let doc = store.get_document("sites", &id).await.unwrap().unwrap();
    assert_eq!(doc["name"], Value::from("north"));
}

#[tokio::test]
async fn test_queue_id_not_reused_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.db");

    let last = {
        let store = SqliteStore::open(&path).unwrap();
        let id = store
            .enqueue(NewEntry::new("sites", site("a"), "A".into(), "hub".into(), 1))
            .await
            .unwrap();
        store.delete_entry(id).await.unwrap();
        id
    };

    let store = SqliteStore::open(&path).unwrap();
    let next = store
        .enqueue(NewEntry::new("sites", site("b"), "A".into(), "hub".into(), 2))
        .await
        .unwrap();
    assert!(next > last);
}
