//! Error types for websocketd.

use thiserror::Error;

/// Main error type for all daemon operations.
#[derive(Debug, Error)]
pub enum WsError {
    /// I/O error from the TCP front-end.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while loading configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Upgrade request carried no `Sec-WebSocket-Key` header.
    #[error("Missing Sec-WebSocket-Key header")]
    MissingKey,

    /// `Sec-WebSocket-Key` is not a base64 encoded 16 byte nonce.
    #[error("Invalid Sec-WebSocket-Key: {0}")]
    InvalidKey(String),

    /// Upgrade request grew past the hard cap without a header terminator.
    #[error("HTTP request exceeds {0} bytes without header terminator")]
    RequestTooLarge(usize),

    /// Protocol violation by the peer (invalid frame, wrong length code, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Frame uses the 64-bit extended length code, which is not supported.
    #[error("64-bit extended payload length is not supported")]
    UnsupportedLength,

    /// Outgoing payload does not fit a 16-bit extended length.
    #[error("Frame payload of {0} bytes exceeds 65535")]
    FrameTooLarge(usize),

    /// Allocation for a handshake or reassembly buffer failed.
    #[error("Out of memory allocating {0} bytes")]
    OutOfMemory(usize),

    /// Session handle is unknown or refers to a recycled slot.
    #[error("Invalid session handle")]
    InvalidSession,

    /// Operation requires a session in the `Connected` state.
    #[error("Session is not connected")]
    NotConnected,

    /// Shared stream is owned by another session.
    #[error("Stream already claimed by another session")]
    StreamBusy,

    /// Every session slot is occupied.
    #[error("Session pool exhausted ({0} slots)")]
    PoolExhausted(usize),

    /// Server was stopped and accepts no more connections.
    #[error("Server stopped")]
    Stopped,

    /// Transport refused the write.
    #[error("Write failed: {0}")]
    Write(#[from] crate::transport::WriteError),

    /// Session already holds its full share of undecoded input. The segment
    /// was not queued; deliver it again once input drains.
    #[error("Receive window full ({0} bytes pending)")]
    WindowFull(usize),

    /// Configuration value out of range.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Result type alias using WsError.
pub type Result<T> = std::result::Result<T, WsError>;
