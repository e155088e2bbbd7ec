//! Error types for the sync module.

use thiserror::Error;

use docrelay_core::Location;

use crate::messages::ErrorCode;

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Protocol version mismatch with peer.
    #[error("protocol version mismatch: local={local}, peer={peer}")]
    VersionMismatch { local: u32, peer: u32 },

    /// Message could not be parsed or arrived out of place.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(String),

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] docrelay_store::StoreError),

    /// Payload could not be interpreted.
    #[error("payload error: {0}")]
    Core(#[from] docrelay_core::CoreError),

    /// The receiving side rejected a document.
    #[error("apply failed: {0}")]
    Apply(String),

    /// Peer sent an error message.
    #[error("peer error ({code:?}): {message}")]
    Peer { code: ErrorCode, message: String },

    /// Timeout waiting for peer.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The connection went away.
    #[error("disconnected")]
    Disconnected,

    /// Delivery needs a registered location and the session has none.
    #[error("session has not registered a location")]
    NotRegistered,

    /// A session tried to register a second, different location.
    #[error("session already registered as {current}, refusing {requested}")]
    AlreadyRegistered {
        current: Location,
        requested: Location,
    },
}

impl SyncError {
    /// Store or channel trouble that clears up on its own; retried after
    /// the poll interval.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(_) | SyncError::Store(_) | SyncError::Timeout(_)
        )
    }

    /// The connection is gone; work resumes on reconnect.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, SyncError::Disconnected)
    }

    /// The wire code reported to the other side for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            SyncError::VersionMismatch { .. } => ErrorCode::VersionMismatch,
            SyncError::NotRegistered => ErrorCode::NotRegistered,
            SyncError::AlreadyRegistered { .. } => ErrorCode::AlreadyRegistered,
            SyncError::InvalidMessage(_) => ErrorCode::InvalidMessage,
            SyncError::Core(_) | SyncError::Apply(_) => ErrorCode::ApplyFailed,
            _ => ErrorCode::Internal,
        }
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_taxonomy() {
        assert!(SyncError::Transport("reset".into()).is_transient());
        assert!(SyncError::Timeout("ack".into()).is_transient());
        assert!(!SyncError::Apply("bad id".into()).is_transient());
        assert!(!SyncError::Core(docrelay_core::CoreError::MissingId).is_transient());
        assert!(SyncError::Disconnected.is_connection_loss());
        assert!(!SyncError::Disconnected.is_transient());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            SyncError::VersionMismatch { local: 1, peer: 0 }.code(),
            ErrorCode::VersionMismatch
        );
        assert_eq!(SyncError::Apply("x".into()).code(), ErrorCode::ApplyFailed);
        assert_eq!(SyncError::Disconnected.code(), ErrorCode::Internal);
    }
}
