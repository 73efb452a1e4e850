//! Error types for the channel point sounds client.

use thiserror::Error;

/// Errors that can occur while running a channel point sounds session.
#[derive(Debug, Error)]
pub enum ChannelPointsError {
    /// Failed to send a frame through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a frame from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection is already closed.
    #[error("transport connection closed")]
    TransportClosed,

    /// The transport could not be opened.
    #[error("connect error: {0}")]
    Connect(String),

    /// Failed to serialize or deserialize a protocol frame or payload.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The identity endpoint answered, but not with exactly one user.
    #[error("user not found")]
    IdentityNotFound,

    /// The identity endpoint could not be reached or refused the request.
    #[error("failed to get user info: {status:?} {message}")]
    IdentityLookup {
        /// HTTP status, when the server answered at all.
        status: Option<u16>,
        /// Status text or transport error description.
        message: String,
    },

    /// The configuration is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),
}

/// A specialized [`Result`] type for channel point sounds operations.
pub type Result<T> = std::result::Result<T, ChannelPointsError>;
