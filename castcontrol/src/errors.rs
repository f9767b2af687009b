//! Error types for the control stack.

use thiserror::Error;

/// Transport and session-level failures.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Channel is closed")]
    ChannelClosed,

    #[error("Certificate verification failed: {0}")]
    Trust(String),

    #[error("Device identity mismatch: expected {expected}, got {actual}")]
    IdentityMismatch { expected: String, actual: String },
}
