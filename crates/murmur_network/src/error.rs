//! Network error types.

use std::time::Duration;

/// Errors that can occur in the murmur_network crate.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// A transport-level failure (dial, listen, read or write).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The connection was closed, either locally or by the remote end.
    #[error("Connection closed")]
    Closed,

    /// The codec could not encode an outgoing message.
    #[error("Encode error: {0}")]
    Encode(String),

    /// The codec could not decode an incoming frame.
    #[error("Decode error: {0}")]
    Decode(String),

    /// An encoded frame exceeds the frame ceiling.
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// A write did not complete before the write deadline.
    #[error("Write timed out after {0:?}")]
    WriteTimeout(Duration),

    /// Dialing a remote address did not complete in time.
    #[error("Connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    /// No broadcast slot became free within the wait window.
    #[error("Broadcast service is busy (no slot free after {0:?}), try again later")]
    BroadcastBusy(Duration),

    /// A peer failed the signal-server handshake.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Discovery subsystem error.
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// The audit store rejected an operation.
    #[error("Persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    /// `serve()` was called on a server that is already serving.
    #[error("Server is already serving")]
    AlreadyServing,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetworkError {
    /// Whether this error ends the connection it happened on.
    ///
    /// Decode failures only cost the single frame; everything else a read
    /// can return leaves the stream in an unknown state.
    pub fn is_fatal_to_connection(&self) -> bool {
        !matches!(self, Self::Decode(_))
    }
}
