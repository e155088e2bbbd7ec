//! Hub-side fan-out of ingested documents.
//!
//! A document arriving from a peer is applied to the hub's own store and
//! then copied into the relay queue once per interested location. The
//! origin location and the sending session's location never get a copy,
//! so a document is not echoed back to where it came from.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::Value as Json;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use docrelay_core::{IdentifierCodec, Location, NewEntry, QueueId};
use docrelay_store::RelayStore;

use crate::apply::{decode_payload, Applied};
use crate::error::{Result, SyncError};
use crate::messages::{RelayMessage, SyncData};
use crate::pump::QueueSignal;
use crate::session::Session;

/// Which collections a location receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interest {
    /// Every collection.
    All,
    /// Only the named collections.
    Collections(BTreeSet<String>),
}

impl Interest {
    /// Whether `collection` is covered.
    pub fn covers(&self, collection: &str) -> bool {
        match self {
            Interest::All => true,
            Interest::Collections(set) => set.contains(collection),
        }
    }
}

/// Subscription table: location to the collections it receives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterestTable {
    entries: BTreeMap<Location, Interest>,
}

impl InterestTable {
    /// An empty table. Nothing fans out until locations subscribe.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every location receives every collection.
    pub fn broadcast<I>(locations: I) -> Self
    where
        I: IntoIterator<Item = Location>,
    {
        Self {
            entries: locations.into_iter().map(|l| (l, Interest::All)).collect(),
        }
    }

    /// Replace the interest of `location`.
    pub fn set(&mut self, location: Location, interest: Interest) {
        self.entries.insert(location, interest);
    }

    /// Add one collection to `location`. A location already receiving
    /// everything is left alone.
    pub fn subscribe(&mut self, location: Location, collection: impl Into<String>) {
        let interest = self
            .entries
            .entry(location)
            .or_insert_with(|| Interest::Collections(BTreeSet::new()));
        if let Interest::Collections(set) = interest {
            set.insert(collection.into());
        }
    }

    /// Stop fanning out to `location`.
    pub fn unsubscribe(&mut self, location: &Location) -> Option<Interest> {
        self.entries.remove(location)
    }

    /// The interest of `location`, if it has one.
    pub fn get(&self, location: &Location) -> Option<&Interest> {
        self.entries.get(location)
    }

    /// Locations that receive `collection`, minus `exclude`, sorted.
    pub fn destinations(&self, collection: &str, exclude: &[&Location]) -> Vec<Location> {
        self.entries
            .iter()
            .filter(|(location, interest)| {
                interest.covers(collection) && !exclude.contains(location)
            })
            .map(|(location, _)| location.clone())
            .collect()
    }

    /// Every location in the table.
    pub fn locations(&self) -> impl Iterator<Item = &Location> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Result of one ingest.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub applied: Applied,
    /// One entry per destination, in enqueue order.
    pub enqueued: Vec<(Location, QueueId)>,
}

/// Applies incoming documents and fans them out to other locations.
pub struct FanoutRouter<S: ?Sized> {
    store: Arc<S>,
    codec: IdentifierCodec,
    local: Location,
    interests: RwLock<InterestTable>,
    signal: QueueSignal,
}

impl<S: RelayStore + ?Sized> FanoutRouter<S> {
    /// Create a router for the hub at `local`.
    ///
    /// `signal` is notified after every fan-out so idle inbound pumps pick
    /// the new entries up without waiting out their poll interval.
    pub fn new(
        store: Arc<S>,
        codec: IdentifierCodec,
        local: Location,
        interests: InterestTable,
        signal: QueueSignal,
    ) -> Self {
        Self {
            store,
            codec,
            local,
            interests: RwLock::new(interests),
            signal,
        }
    }

    /// The hub's own location. Never a fan-out destination.
    pub fn local(&self) -> &Location {
        &self.local
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Replace the interest of one location.
    pub async fn set_interest(&self, location: Location, interest: Interest) {
        self.interests.write().await.set(location, interest);
    }

    /// Add one collection to a location's interest.
    pub async fn subscribe(&self, location: Location, collection: impl Into<String>) {
        self.interests.write().await.subscribe(location, collection);
    }

    /// Remove a location from fan-out.
    pub async fn unsubscribe(&self, location: &Location) -> Option<Interest> {
        self.interests.write().await.unsubscribe(location)
    }

    /// A copy of the current table.
    pub async fn interests(&self) -> InterestTable {
        self.interests.read().await.clone()
    }

    /// Apply `payload` to `collection` and enqueue a copy for every
    /// interested location other than the origin, the sender, and this hub.
    ///
    /// The apply and the fan-out entries commit together. On error nothing
    /// is stored or acknowledged, and the sender retries the whole ingest.
    pub async fn ingest(
        &self,
        sender: Option<&Location>,
        collection: &str,
        payload: &Json,
        origin: &Location,
        timestamp: i64,
    ) -> Result<IngestOutcome> {
        if collection.is_empty() {
            return Err(SyncError::Apply("collection name is empty".into()));
        }
        let (id, document) = decode_payload(&self.codec, payload)?;

        let mut exclude = vec![origin, &self.local];
        exclude.extend(sender);
        let destinations = self
            .interests
            .read()
            .await
            .destinations(collection, &exclude);

        let entries = destinations
            .iter()
            .map(|destination| {
                NewEntry::new(
                    collection,
                    document.clone(),
                    origin.clone(),
                    destination.clone(),
                    timestamp,
                )
            })
            .collect();
        let (outcome, ids) = self
            .store
            .upsert_and_enqueue(collection, &id, &document, entries)
            .await?;
        let applied = Applied {
            id,
            document,
            outcome,
        };
        if !ids.is_empty() {
            self.signal.notify();
        }

        debug!(
            collection,
            id = %applied.id,
            origin = %origin,
            outcome = ?applied.outcome,
            fanout = ids.len(),
            "ingested document"
        );

        Ok(IngestOutcome {
            applied,
            enqueued: destinations.into_iter().zip(ids).collect(),
        })
    }

    /// Handle a peer's `sync-data` and build the `ack` reply.
    pub async fn handle_sync_data(&self, session: &Session, data: &SyncData) -> RelayMessage {
        let sender = session.location();
        match self
            .ingest(
                sender,
                &data.collection,
                &data.document,
                &data.origin_location,
                data.timestamp,
            )
            .await
        {
            Ok(_) => RelayMessage::saved(data.queue_id),
            Err(error) => {
                warn!(
                    connection = %session.id(),
                    queue_id = %data.queue_id,
                    collection = %data.collection,
                    %error,
                    "rejecting sync-data"
                );
                RelayMessage::ack_error(data.queue_id, error.to_string())
            }
        }
    }
}
