//! Error types for hubs and peers.

use docrelay_core::{CoreError, Location};
use docrelay_store::StoreError;
use docrelay_sync::{ErrorCode, SyncError};
use thiserror::Error;

/// Errors that can occur while running a hub or a peer.
#[derive(Debug, Error)]
pub enum RelayError {
    /// A configuration value is missing or malformed.
    #[error("configuration error: {0}")]
    Config(String),

    /// The store could not be opened at startup.
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Document could not be interpreted.
    #[error("document error: {0}")]
    Document(#[from] CoreError),

    /// The hub refused this peer for good.
    #[error("hub rejected {location} ({code:?}): {message}")]
    Rejected {
        location: Location,
        code: ErrorCode,
        message: String,
    },

    /// Gave up reconnecting.
    #[error("gave up after {attempts} failed connection attempts")]
    ReconnectExhausted { attempts: u32 },
}

/// Result type for hub and peer operations.
pub type Result<T> = std::result::Result<T, RelayError>;
