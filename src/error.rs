//! Error types for scopebus

use thiserror::Error;

/// Errors that can occur in the event bus
#[derive(Debug, Error)]
pub enum BusError {
    /// Scope string failed to parse
    #[error("Invalid scope '{scope}': {reason}")]
    InvalidScope { scope: String, reason: String },

    /// Illegal lifecycle transition (double activate, reactivation, ...)
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// Operation requires an active connector or participant
    #[error("Not active")]
    Inactive,

    /// Transport connection failure (bind, connect, handshake)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Transport I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire framing violation (oversized or truncated message)
    #[error("Frame error: {0}")]
    Frame(String),

    /// Notification encode/decode failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Publish failure
    #[error("Failed to publish event to scope '{scope}': {reason}")]
    Publish { scope: String, reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested quality-of-service spec cannot be honored
    #[error("Quality-of-service spec not supported: {0}")]
    QualityOfService(String),

    /// Dispatch queue stayed full past the configured deadline
    #[error("Dispatch backpressure: {0}")]
    Backpressure(String),

    /// Handler id is not registered
    #[error("Unknown handler id {0}")]
    UnknownHandler(u64),

    /// Handler reported a failure
    #[error("Handler error: {0}")]
    Handler(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Call was cancelled before a reply arrived
    #[error("Call cancelled")]
    Canceled,

    /// Server-side callback failed; carried back as an error reply
    #[error("Remote call failed: {0}")]
    RemoteCall(String),
}

/// Result type alias for bus operations
pub type Result<T> = std::result::Result<T, BusError>;
