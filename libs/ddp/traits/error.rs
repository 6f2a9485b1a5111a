use thiserror::Error;

/// Main error type for the DDP client
#[derive(Error, Debug)]
pub enum DdpError {
    /// Socket-level failure while opening or using the transport
    #[error("Transport error: {0}")]
    Transport(String),

    /// The server answered a request with an `error` body
    #[error("Protocol error [{code}]: {reason}")]
    Protocol { code: String, reason: String },

    /// Incoming text could not be decoded into a frame
    #[error("Decode error: {0}")]
    Decode(String),

    /// Outgoing frame could not be serialized
    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// Handshake not acknowledged in time
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Transport went away while the operation was outstanding
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Operation requires an open connection
    #[error("Not connected")]
    NotConnected,

    /// Server refused every protocol version we offered
    #[error("Connection rejected, server suggests version {version:?}")]
    ConnectionRejected { version: Option<String> },

    /// Correlation id is already waiting for a response
    #[error("Correlation id already pending: {0}")]
    DuplicateId(String),

    /// Login payload could not be built or login response was malformed
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Connection driver is gone
    #[error("Connection driver channel closed")]
    ChannelClosed,
}

impl DdpError {
    /// True for the synthetic error used when pending operations are
    /// flushed by a transport loss.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, DdpError::ConnectionLost(_))
    }

    /// True when a handshake deadline expired
    pub fn is_timeout(&self) -> bool {
        matches!(self, DdpError::Timeout(_))
    }
}

/// Result type for DDP client operations
pub type Result<T> = std::result::Result<T, DdpError>;
