//! Per-connection session records.
//!
//! A [`Session`] is created when a connection opens and shared by reference
//! with everything that works on that connection. Registration sets the
//! session's location exactly once; delivery to a peer is only attempted
//! once its session is registered.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::sync::RwLock;

use docrelay_core::{now_millis, Location};

use crate::error::{Result, SyncError};
use crate::messages::PROTOCOL_VERSION;

/// Process-unique id of one connection.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone)]
struct Registration {
    location: Location,
    protocol_version: u32,
}

/// State of one connection.
#[derive(Debug)]
pub struct Session {
    id: ConnectionId,
    remote: String,
    opened_at: i64,
    registration: OnceLock<Registration>,
}

impl Session {
    /// A fresh, unregistered session.
    pub fn new(id: ConnectionId, remote: impl Into<String>) -> Self {
        Self {
            id,
            remote: remote.into(),
            opened_at: now_millis(),
            registration: OnceLock::new(),
        }
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Transport label of the remote end.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// When the connection opened (Unix ms).
    pub fn opened_at(&self) -> i64 {
        self.opened_at
    }

    /// The registered location, if any.
    pub fn location(&self) -> Option<&Location> {
        self.registration.get().map(|r| &r.location)
    }

    /// Protocol version declared at registration.
    pub fn protocol_version(&self) -> Option<u32> {
        self.registration.get().map(|r| r.protocol_version)
    }

    /// Whether the peer has registered.
    pub fn is_registered(&self) -> bool {
        self.registration.get().is_some()
    }

    /// The registered location, or [`SyncError::NotRegistered`].
    pub fn require_location(&self) -> Result<&Location> {
        self.location().ok_or(SyncError::NotRegistered)
    }

    /// Register `location` for this connection.
    ///
    /// Returns `true` on first registration and `false` when the same
    /// location registers again. A different location, or a protocol
    /// version other than [`PROTOCOL_VERSION`], is refused.
    pub fn register(&self, location: Location, protocol_version: u32) -> Result<bool> {
        if protocol_version != PROTOCOL_VERSION {
            return Err(SyncError::VersionMismatch {
                local: PROTOCOL_VERSION,
                peer: protocol_version,
            });
        }

        let mut first = false;
        let current = self.registration.get_or_init(|| {
            first = true;
            Registration {
                location: location.clone(),
                protocol_version,
            }
        });

        if current.location != location {
            return Err(SyncError::AlreadyRegistered {
                current: current.location.clone(),
                requested: location,
            });
        }
        Ok(first)
    }
}

/// The hub's table of open connections.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<ConnectionId, Arc<Session>>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session for a new connection.
    pub async fn open(&self, remote: &str) -> Arc<Session> {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let session = Arc::new(Session::new(id, remote));
        self.sessions.write().await.insert(id, Arc::clone(&session));
        session
    }

    /// Forget a closed connection.
    pub async fn close(&self, id: ConnectionId) -> Option<Arc<Session>> {
        self.sessions.write().await.remove(&id)
    }

    /// Number of open connections.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether no connection is open.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Locations registered on open connections, sorted, without duplicates.
    pub async fn registered_locations(&self) -> Vec<Location> {
        let sessions = self.sessions.read().await;
        let mut locations: Vec<Location> = sessions
            .values()
            .filter_map(|s| s.location().cloned())
            .collect();
        locations.sort();
        locations.dedup();
        locations
    }

    /// Open sessions registered as `location`.
    pub async fn sessions_for(&self, location: &Location) -> Vec<Arc<Session>> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|s| s.location() == Some(location))
            .cloned()
            .collect()
    }
}
