//! Relay queue entries: durable records of pending cross-node deliveries.
//!
//! An entry exists exactly as long as its payload has not been confirmed
//! applied at `destination_location`.

use serde::{Deserialize, Serialize};

use crate::retry::{FailureDisposition, RetryPolicy};
use crate::types::{Location, ObjectId, QueueId};
use crate::value::{document_id, Document};

/// A pending delivery, as stored in a relay queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayQueueEntry {
    /// Store-assigned id; also the FIFO order key.
    pub queue_id: QueueId,
    /// Target collection at the destination.
    pub collection: String,
    /// Document to apply, `_id` included.
    pub document: Document,
    /// Location the document was first written at.
    pub origin_location: Location,
    /// Location whose store must receive the document.
    pub destination_location: Location,
    /// Origin timestamp (Unix ms).
    pub timestamp: i64,
    /// Set after the receiving side reported a failure.
    pub error: bool,
    /// Last failure reported by the receiving side.
    pub error_message: Option<String>,
    /// Failed delivery attempts so far.
    pub attempts: u32,
    /// Not offered before this time (Unix ms).
    pub retry_at: Option<i64>,
    /// Parked after exhausting the retry policy.
    pub dead_letter: bool,
    /// Claimed by a pump until this time (Unix ms).
    pub claimed_until: Option<i64>,
}

impl RelayQueueEntry {
    /// The document this entry writes at its destination, if it names one.
    pub fn delivery_key(&self) -> Option<DeliveryKey> {
        let document = document_id(&self.document).ok()?;
        Some(DeliveryKey {
            destination: self.destination_location.clone(),
            collection: self.collection.clone(),
            document,
        })
    }

    /// Whether a pump may pick this entry up at `now`.
    ///
    /// Eligibility only looks at this entry. Stores additionally hold back
    /// an entry while an older live entry shares its [`DeliveryKey`].
    pub fn is_eligible(&self, now: i64) -> bool {
        !self.dead_letter
            && self.retry_at.map_or(true, |t| t <= now)
            && self.claimed_until.map_or(true, |t| t <= now)
    }

    /// Record a failed delivery at `now` and apply the retry policy.
    ///
    /// Also drops any claim, so the entry is governed by `retry_at` alone.
    pub fn record_failure(&mut self, message: &str, policy: &RetryPolicy, now: i64) -> EntryStatus {
        self.error = true;
        self.error_message = Some(message.to_string());
        self.attempts = self.attempts.saturating_add(1);
        self.claimed_until = None;

        match policy.on_failure(self.attempts, now) {
            FailureDisposition::RetryAt(at) => {
                self.retry_at = Some(at);
                EntryStatus::Pending {
                    attempts: self.attempts,
                    retry_at: at,
                }
            }
            FailureDisposition::DeadLetter => {
                self.retry_at = None;
                self.dead_letter = true;
                EntryStatus::DeadLetter {
                    attempts: self.attempts,
                }
            }
        }
    }

    /// Clear failure state so the entry is offered again right away.
    pub fn reset(&mut self) {
        self.error = false;
        self.error_message = None;
        self.attempts = 0;
        self.retry_at = None;
        self.dead_letter = false;
        self.claimed_until = None;
    }
}

/// One document at one destination.
///
/// Live entries sharing a key are applied in queue order, so a deferred
/// older write can never land on top of a newer one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryKey {
    pub destination: Location,
    pub collection: String,
    pub document: ObjectId,
}

/// An entry about to be enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntry {
    pub collection: String,
    pub document: Document,
    pub origin_location: Location,
    pub destination_location: Location,
    pub timestamp: i64,
}

impl NewEntry {
    /// Create a new entry addressed to `destination`.
    pub fn new(
        collection: impl Into<String>,
        document: Document,
        origin: Location,
        destination: Location,
        timestamp: i64,
    ) -> Self {
        Self {
            collection: collection.into(),
            document,
            origin_location: origin,
            destination_location: destination,
            timestamp,
        }
    }

    /// Materialize with a store-assigned id.
    pub fn into_entry(self, queue_id: QueueId) -> RelayQueueEntry {
        RelayQueueEntry {
            queue_id,
            collection: self.collection,
            document: self.document,
            origin_location: self.origin_location,
            destination_location: self.destination_location,
            timestamp: self.timestamp,
            error: false,
            error_message: None,
            attempts: 0,
            retry_at: None,
            dead_letter: false,
            claimed_until: None,
        }
    }
}

/// State of an entry after a failure was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// Will be offered again at `retry_at`.
    Pending { attempts: u32, retry_at: i64 },
    /// Parked until requeued by hand.
    DeadLetter { attempts: u32 },
}
