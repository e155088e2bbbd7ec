//! Error types for docrelay core.

use thiserror::Error;

/// Errors raised while interpreting documents and identifiers.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A string could not be parsed as an [`ObjectId`](crate::ObjectId).
    #[error("invalid object id: {0:?}")]
    InvalidObjectId(String),

    /// Payload structure is unusable (bad tag, too deep, wrong shape).
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Document has no `_id` field.
    #[error("document has no _id")]
    MissingId,

    /// Document `_id` is present but not an identifier.
    #[error("document _id is not an object id: {0}")]
    InvalidId(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
