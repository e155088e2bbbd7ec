//! Applying delivered documents to a store.
//!
//! Both directions apply the same way: decode the payload, pull out `_id`,
//! and upsert the remaining fields keyed by it. Applying a payload twice
//! leaves the store as applying it once, which is what makes redelivery
//! after a lost ack safe.

use serde_json::Value as Json;

use docrelay_core::{strip_id, Document, IdentifierCodec, ObjectId, Value, ID_FIELD};
use docrelay_store::{DocumentStore, UpsertResult};

use crate::error::{Result, SyncError};
use crate::messages::{RelayMessage, ServerSync};

/// A document that was applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    /// The document's identifier.
    pub id: ObjectId,
    /// The decoded payload in canonical native form, `_id` included.
    pub document: Document,
    /// What the upsert did.
    pub outcome: UpsertResult,
}

/// Decode a wire payload into a canonical native document.
///
/// The `_id` must be present and resolve to an identifier.
pub fn decode_payload(codec: &IdentifierCodec, payload: &Json) -> Result<(ObjectId, Document)> {
    let document = codec.decode_document(payload)?;
    let (id, fields) = strip_id(document)?;
    let mut document = fields;
    document.insert(ID_FIELD.to_string(), Value::ObjectId(id));
    Ok((id, document))
}

/// Upsert a wire payload into `collection`.
pub async fn apply_payload<D>(
    store: &D,
    codec: &IdentifierCodec,
    collection: &str,
    payload: &Json,
) -> Result<Applied>
where
    D: DocumentStore + ?Sized,
{
    let (id, document) = decode_payload(codec, payload)?;
    let outcome = apply_document(store, collection, id, &document).await?;
    Ok(Applied {
        id,
        document,
        outcome,
    })
}

/// Upsert an already decoded document. `_id` in `document` is never written.
pub async fn apply_document<D>(
    store: &D,
    collection: &str,
    id: ObjectId,
    document: &Document,
) -> Result<UpsertResult>
where
    D: DocumentStore + ?Sized,
{
    if collection.is_empty() {
        return Err(SyncError::Apply("collection name is empty".into()));
    }
    let outcome = store.upsert_document(collection, &id, document).await?;
    tracing::trace!(collection, id = %id, ?outcome, "applied document");
    Ok(outcome)
}

/// Apply a hub push and build the `server-ack` reply.
///
/// Failures are reported to the hub, never raised: the hub keeps the entry
/// and retries it under its retry policy.
pub async fn handle_server_sync<D>(
    store: &D,
    codec: &IdentifierCodec,
    push: &ServerSync,
) -> RelayMessage
where
    D: DocumentStore + ?Sized,
{
    match apply_payload(store, codec, &push.collection, &push.document).await {
        Ok(applied) => {
            tracing::debug!(
                queue_id = %push.queue_id,
                collection = %push.collection,
                origin = %push.origin_location,
                id = %applied.id,
                "applied server-sync"
            );
            RelayMessage::received(push.queue_id)
        }
        Err(error) => {
            tracing::warn!(
                queue_id = %push.queue_id,
                collection = %push.collection,
                %error,
                "rejecting server-sync"
            );
            RelayMessage::server_ack_error(push.queue_id, error.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docrelay_store::MemoryStore;
    use serde_json::json;

    const HEX: &str = "507f191e810c19729de860ea";

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let store = MemoryStore::new();
        let codec = IdentifierCodec::default();
        let payload = json!({"_id": {"$oid": HEX}, "name": "x"});

        let first = apply_payload(&store, &codec, "sites", &payload).await.unwrap();
        let second = apply_payload(&store, &codec, "sites", &payload).await.unwrap();
        assert_eq!(first.outcome, UpsertResult::Inserted);
        assert_eq!(second.outcome, UpsertResult::Unchanged);
        assert_eq!(store.count_documents("sites").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_partial_update_keeps_other_fields() {
        let store = MemoryStore::new();
        let codec = IdentifierCodec::default();
        apply_payload(
            &store,
            &codec,
            "sites",
            &json!({"_id": {"$oid": HEX}, "name": "x", "region": "north"}),
        )
        .await
        .unwrap();

        apply_payload(&store, &codec, "sites", &json!({"_id": {"$oid": HEX}, "name": "y"}))
            .await
            .unwrap();

        let id = ObjectId::from_hex(HEX).unwrap();
        let stored = store.get_document("sites", &id).await.unwrap().unwrap();
        assert_eq!(stored["name"], Value::from("y"));
        assert_eq!(stored["region"], Value::from("north"));
        assert_eq!(stored[ID_FIELD], Value::ObjectId(id));
    }

    #[tokio::test]
    async fn test_plain_hex_id_is_accepted() {
        let store = MemoryStore::new();
        let applied = apply_payload(
            &store,
            &IdentifierCodec::default(),
            "sites",
            &json!({"_id": HEX, "name": "x"}),
        )
        .await
        .unwrap();
        assert_eq!(applied.id, ObjectId::from_hex(HEX).unwrap());
        assert_eq!(applied.document[ID_FIELD], Value::ObjectId(applied.id));
    }

    #[tokio::test]
    async fn test_server_sync_reply() {
        let store = MemoryStore::new();
        let codec = IdentifierCodec::default();
        let mut push = ServerSync {
            queue_id: docrelay_core::QueueId(9),
            collection: "sites".into(),
            document: json!({"_id": {"$oid": HEX}, "name": "x"}),
            origin_location: "B".into(),
            timestamp: 0,
        };

        let reply = handle_server_sync(&store, &codec, &push).await;
        assert_eq!(reply, RelayMessage::received(push.queue_id));

        push.document = json!({"name": "no id"});
        let reply = handle_server_sync(&store, &codec, &push).await;
        assert!(matches!(
            reply,
            RelayMessage::ServerAck {
                status: crate::messages::AckStatus::Error,
                error: Some(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_bad_payloads_are_apply_errors() {
        let store = MemoryStore::new();
        let codec = IdentifierCodec::default();

        for payload in [
            json!({"name": "no id"}),
            json!({"_id": "not-hex"}),
            json!({"_id": {"$oid": "short"}}),
            json!([1, 2, 3]),
        ] {
            let err = apply_payload(&store, &codec, "sites", &payload).await.unwrap_err();
            assert!(!err.is_transient(), "{payload} gave {err}");
        }

        let err = apply_payload(&store, &codec, "", &json!({"_id": HEX}))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Apply(_)));
        assert_eq!(store.count_documents("sites").await.unwrap(), 0);
    }
}
