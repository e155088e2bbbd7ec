//! Wire messages exchanged between hub and peers.
//!
//! Every message is one JSON object tagged by its `event` name. Document
//! payloads travel as JSON produced by the identifier codec, so embedded
//! identifiers appear in the tagged `{"$oid": ...}` form.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use docrelay_core::{Location, QueueId};

/// Current protocol version, carried in the registration handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Relay protocol messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum RelayMessage {
    /// Peer to hub, once per connection: declare the peer's location.
    RegisterLocation {
        location: Location,
        protocol_version: u32,
    },

    /// Hub to peer: registration accepted.
    Registered { location: Location },

    /// Peer to hub: apply this document to the hub's store.
    SyncData(SyncData),

    /// Hub to peer: outcome of a `sync-data`.
    Ack {
        status: AckStatus,
        queue_id: QueueId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Hub to peer: push of a pending relay entry.
    ServerSync(ServerSync),

    /// Peer to hub: outcome of a `server-sync`.
    ServerAck {
        status: AckStatus,
        queue_id: QueueId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Error condition.
    Error {
        /// Error code for programmatic handling.
        code: ErrorCode,
        /// Human-readable description.
        message: String,
    },
}

impl RelayMessage {
    /// The `event` tag, for logging.
    pub fn event(&self) -> &'static str {
        match self {
            RelayMessage::RegisterLocation { .. } => "register-location",
            RelayMessage::Registered { .. } => "registered",
            RelayMessage::SyncData(_) => "sync-data",
            RelayMessage::Ack { .. } => "ack",
            RelayMessage::ServerSync(_) => "server-sync",
            RelayMessage::ServerAck { .. } => "server-ack",
            RelayMessage::Error { .. } => "error",
        }
    }

    /// Successful `ack` for a peer's `sync-data`.
    pub fn saved(queue_id: QueueId) -> Self {
        RelayMessage::Ack {
            status: AckStatus::Saved,
            queue_id,
            error: None,
        }
    }

    /// Failed `ack` for a peer's `sync-data`.
    pub fn ack_error(queue_id: QueueId, error: impl Into<String>) -> Self {
        RelayMessage::Ack {
            status: AckStatus::Error,
            queue_id,
            error: Some(error.into()),
        }
    }

    /// Failed `server-ack` for a hub's `server-sync`.
    pub fn server_ack_error(queue_id: QueueId, error: impl Into<String>) -> Self {
        RelayMessage::ServerAck {
            status: AckStatus::Error,
            queue_id,
            error: Some(error.into()),
        }
    }

    /// Successful `server-ack` for a hub's `server-sync`.
    pub fn received(queue_id: QueueId) -> Self {
        RelayMessage::ServerAck {
            status: AckStatus::Received,
            queue_id,
            error: None,
        }
    }
}

/// Body of a `sync-data` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncData {
    pub collection: String,
    /// Codec-encoded document, `_id` included.
    pub document: Json,
    /// The sender's queue entry; echoed back in the `ack`.
    pub queue_id: QueueId,
    pub origin_location: Location,
    pub destination_location: Location,
    pub timestamp: i64,
}

/// Body of a `server-sync` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSync {
    /// The hub's queue entry; echoed back in the `server-ack`.
    pub queue_id: QueueId,
    pub collection: String,
    /// Codec-encoded document, `_id` included.
    pub document: Json,
    pub origin_location: Location,
    pub timestamp: i64,
}

/// Outcome carried by `ack` and `server-ack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    /// The hub stored the document (`ack`).
    Saved,
    /// The peer applied the document (`server-ack`).
    Received,
    /// The receiving side failed to apply the document.
    Error,
}

impl AckStatus {
    /// Whether the receiving side applied the document.
    pub fn is_success(self) -> bool {
        !matches!(self, AckStatus::Error)
    }
}

/// Error codes for the relay protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Registration carried an unsupported protocol version.
    VersionMismatch,
    /// Location already registered on this connection.
    AlreadyRegistered,
    /// Operation needs a registered location.
    NotRegistered,
    /// Message could not be understood.
    InvalidMessage,
    /// Document could not be applied.
    ApplyFailed,
    /// Anything else.
    Internal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_wire_shape() {
        let msg = RelayMessage::RegisterLocation {
            location: "A".into(),
            protocol_version: PROTOCOL_VERSION,
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"event": "register-location", "location": "A", "protocol_version": 1})
        );
    }

    #[test]
    fn test_ack_omits_missing_error() {
        let wire = serde_json::to_value(RelayMessage::saved(QueueId(7))).unwrap();
        assert_eq!(wire, json!({"event": "ack", "status": "saved", "queue_id": 7}));

        let parsed: RelayMessage = serde_json::from_value(json!({
            "event": "server-ack",
            "status": "error",
            "queue_id": 3,
            "error": "bad _id"
        }))
        .unwrap();
        assert_eq!(
            parsed,
            RelayMessage::ServerAck {
                status: AckStatus::Error,
                queue_id: QueueId(3),
                error: Some("bad _id".into()),
            }
        );
    }

    #[test]
    fn test_sync_data_parses() {
        let parsed: RelayMessage = serde_json::from_value(json!({
            "event": "sync-data",
            "collection": "sites",
            "document": {"_id": {"$oid": "507f191e810c19729de860ea"}, "name": "x"},
            "queue_id": 1,
            "origin_location": "A",
            "destination_location": "hub",
            "timestamp": 1700000000000i64
        }))
        .unwrap();
        let RelayMessage::SyncData(data) = parsed else {
            panic!("expected sync-data");
        };
        assert_eq!(data.collection, "sites");
        assert_eq!(data.queue_id, QueueId(1));
        assert_eq!(data.origin_location.as_str(), "A");
    }

    #[test]
    fn test_server_sync_wire_shape() {
        let msg = RelayMessage::ServerSync(ServerSync {
            queue_id: QueueId(4),
            collection: "sites".into(),
            document: json!({"name": "x"}),
            origin_location: "B".into(),
            timestamp: 5,
        });
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "event": "server-sync",
                "queue_id": 4,
                "collection": "sites",
                "document": {"name": "x"},
                "origin_location": "B",
                "timestamp": 5
            })
        );
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        let parsed = serde_json::from_value::<RelayMessage>(json!({"event": "bogus"}));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_ack_status() {
        assert!(AckStatus::Saved.is_success());
        assert!(AckStatus::Received.is_success());
        assert!(!AckStatus::Error.is_success());
    }
}
