//! Proptest generators for property-based testing.

use proptest::prelude::*;

use docrelay_core::{Document, Location, NewEntry, ObjectId, Value, ID_FIELD};

/// Generate a random ObjectId.
pub fn object_id() -> impl Strategy<Value = ObjectId> {
    any::<[u8; 12]>().prop_map(ObjectId::from_bytes)
}

/// Generate a location name.
pub fn location() -> impl Strategy<Value = Location> {
    "[A-Z][a-z0-9]{0,7}".prop_map(Location::from)
}

/// Generate a collection name.
pub fn collection_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,15}".prop_map(String::from)
}

/// Generate a field name. Never `_id` and never `$`-prefixed.
pub fn field_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,11}".prop_map(String::from)
}

/// Generate a leaf value.
pub fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        (-1.0e9f64..1.0e9f64).prop_map(Value::Float),
        ".{0,24}".prop_map(Value::String),
        object_id().prop_map(Value::ObjectId),
    ]
}

/// Generate a value tree up to four levels deep.
pub fn value() -> impl Strategy<Value = Value> {
    scalar().prop_recursive(4, 48, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
            prop::collection::btree_map(field_name(), inner, 0..6).prop_map(Value::Document),
        ]
    })
}

/// Generate a document without `_id`.
pub fn fields() -> impl Strategy<Value = Document> {
    prop::collection::btree_map(field_name(), value(), 0..8)
}

/// Generate a document with a native `_id`.
pub fn document() -> impl Strategy<Value = Document> {
    (object_id(), fields()).prop_map(|(id, mut doc)| {
        doc.insert(ID_FIELD.to_string(), Value::ObjectId(id));
        doc
    })
}

/// Parameters for generating a queue entry.
#[derive(Debug, Clone)]
pub struct EntryParams {
    pub collection: String,
    pub document: Document,
    pub origin: Location,
    pub destination: Location,
    pub timestamp: i64,
}

impl Arbitrary for EntryParams {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (
            collection_name(),
            document(),
            location(),
            location(),
            0i64..=1_700_000_000_000i64, // timestamp
        )
            .prop_map(|(collection, document, origin, destination, timestamp)| EntryParams {
                collection,
                document,
                origin,
                destination,
                timestamp,
            })
            .boxed()
    }
}

/// Build the entry described by `params`.
pub fn new_entry(params: &EntryParams) -> NewEntry {
    NewEntry::new(
        params.collection.clone(),
        params.document.clone(),
        params.origin.clone(),
        params.destination.clone(),
        params.timestamp,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use docrelay_core::IdentifierCodec;
    use docrelay_store::{DocumentStore, MemoryStore, QueueFilter, RelayQueueStore};
    use docrelay_sync::apply_payload;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    proptest! {
        #[test]
        fn test_codec_round_trips_documents(doc in document()) {
            let codec = IdentifierCodec::default();
            let wire = codec.encode_document(&doc).unwrap();
            prop_assert_eq!(codec.decode_document(&wire).unwrap(), doc);
        }

        #[test]
        fn test_apply_twice_equals_apply_once(
            doc in document(),
            collection in collection_name(),
        ) {
            let codec = IdentifierCodec::default();
            let wire = codec.encode_document(&doc).unwrap();

            let (once, twice) = runtime().block_on(async {
                let once = MemoryStore::new();
                let applied = apply_payload(&once, &codec, &collection, &wire).await.unwrap();

                let twice = MemoryStore::new();
                apply_payload(&twice, &codec, &collection, &wire).await.unwrap();
                apply_payload(&twice, &codec, &collection, &wire).await.unwrap();

                (
                    once.get_document(&collection, &applied.id).await.unwrap(),
                    twice.get_document(&collection, &applied.id).await.unwrap(),
                )
            });
            prop_assert!(once.is_some());
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn test_claims_are_fifo_per_destination(
            entries in prop::collection::vec(any::<EntryParams>(), 1..20),
        ) {
            let order = runtime().block_on(async {
                let store = MemoryStore::new();
                let mut ids = Vec::new();
                for params in &entries {
                    let id = store.enqueue(new_entry(params)).await.unwrap();
                    ids.push((params.destination.clone(), id));
                }

                let mut drained = Vec::new();
                let mut destinations: Vec<_> = ids.iter().map(|(d, _)| d.clone()).collect();
                destinations.sort();
                destinations.dedup();
                for destination in destinations {
                    let filter = QueueFilter::Destination(destination.clone());
                    while let Some(entry) = store
                        .claim_oldest(&filter, Duration::from_secs(60))
                        .await
                        .unwrap()
                    {
                        store.delete_entry(entry.queue_id).await.unwrap();
                        drained.push((destination.clone(), entry.queue_id));
                    }
                }
                (ids, drained)
            });

            let (ids, drained) = order;
            prop_assert_eq!(ids.len(), drained.len());
            for (destination, _) in &ids {
                let expected: Vec<_> = ids.iter().filter(|(d, _)| d == destination).map(|(_, id)| *id).collect();
                let got: Vec<_> = drained.iter().filter(|(d, _)| d == destination).map(|(_, id)| *id).collect();
                prop_assert_eq!(expected, got);
            }
        }
    }
}
