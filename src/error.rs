//! Error types for openchamber-sync
//!
//! This module defines the error types used throughout the crate,
//! using `thiserror` for ergonomic error handling.
//!
//! Most of the reconciliation core never returns these to its callers:
//! transport and fetch failures are logged and degrade to retry or no-op.
//! They surface from construction (configuration, storage, HTTP client)
//! and from the CLI's one-shot commands.

use thiserror::Error;

/// Main error type for openchamber-sync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport errors (stream subscription, HTTP status failures)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Event or snapshot payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Cursor storage errors (database operations)
    #[error("Storage error: {0}")]
    Storage(String),

    /// An operation was cancelled before it could apply its result
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Reasons a raw stream frame or snapshot payload was rejected by the decoder
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The frame body is not valid JSON
    #[error("frame is not valid JSON: {0}")]
    NotJson(String),

    /// No `type` discriminator could be found in the envelope
    #[error("event envelope has no type")]
    MissingType,

    /// The event needs a session or message id and none could be resolved
    #[error("{event_type} carries no resolvable identifier")]
    MissingIdentifier {
        /// Normalized event type that was being decoded
        event_type: String,
    },

    /// The payload has the right type but an unusable shape
    #[error("invalid {what} payload")]
    InvalidPayload {
        /// Which payload was malformed (e.g. "message info", "part")
        what: &'static str,
    },
}

/// Result type alias for openchamber-sync operations
///
/// Uses `anyhow::Error` so call sites can attach context while the
/// underlying `SyncError` stays downcastable.
pub type Result<T> = anyhow::Result<T>;
