//! Error types for the ADS client.

use thiserror::Error;

/// Error type for the ADS client.
#[derive(Debug, Error)]
pub enum Error {
    /// The channel to the control plane could not be built or the endpoint is unreachable.
    #[error("connection error: {0}")]
    Connection(String),

    /// The ADS stream could not be opened, or failed while reading from it.
    #[error("stream error: {0}")]
    Stream(String),

    /// The server closed the stream, or the send half is gone.
    #[error("stream closed")]
    StreamClosed,

    /// The session was torn down while an operation was in flight.
    #[error("session cancelled")]
    Cancelled,

    /// A message could not be decoded from its wire format.
    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// A resource carried a different type URL than the one it was decoded as.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// The type URL the resource was expected to have.
        expected: &'static str,
        /// The type URL the resource actually carried.
        actual: String,
    },

    /// A value decoded but is not valid, or a configuration value is out of range.
    #[error("validation error: {0}")]
    Validation(String),
}

/// Result type alias for ADS client operations.
pub type Result<T> = std::result::Result<T, Error>;
