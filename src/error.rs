//! Error types for storage, persistence and cross-tab messages.

use std::time::Duration;

// =============================================================================
// STORE
// =============================================================================

/// Failures of the durable key/value store.
///
/// These never reach form status: the local store is a best-effort cache.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Writing `key` would exceed the store's byte quota.
    #[error("storage quota exceeded writing {key}: need {needed} bytes, {available} available")]
    QuotaExceeded { key: String, needed: usize, available: usize },

    /// The backing medium failed for `key`.
    #[error("storage I/O failed for {key}: {message}")]
    Io { key: String, message: String },

    /// The value for `key` could not be encoded as JSON.
    #[error("could not encode value for {key}: {message}")]
    Encode { key: String, message: String },

    /// The store cannot be used at all (e.g. disabled by the user agent).
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

// =============================================================================
// SAVE
// =============================================================================

/// Failure of the caller-supplied persistence path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SaveError {
    /// The persistence call rejected. The message is shown to the user.
    #[error("{0}")]
    Failed(String),

    /// The persistence call did not settle within the configured timeout.
    #[error("save timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),
}

impl SaveError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

// =============================================================================
// MESSAGE
// =============================================================================

/// Reasons a broadcast record is rejected at the storage boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    /// Not JSON, unknown `type`, or a field of the wrong shape.
    #[error("malformed cross-tab message: {0}")]
    Malformed(String),

    /// A required identifier is empty.
    #[error("cross-tab message missing {0}")]
    MissingField(&'static str),

    /// The record under `key` names a different form.
    #[error("cross-tab message under {key} names form {form_id}")]
    FormMismatch { key: String, form_id: String },
}
