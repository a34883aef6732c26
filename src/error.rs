//! Error types for the bridge library.

use std::io;
use thiserror::Error;

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Status codes surfaced to the gateway runtime when a session aborts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortCode {
    /// The upstream server could not be reached within the configured retries.
    UpstreamNotFound,
    /// The upstream connection failed mid-session.
    UpstreamError,
}

impl AbortCode {
    /// Numeric status code carried on the downstream wire.
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            AbortCode::UpstreamNotFound => 0x0207,
            AbortCode::UpstreamError => 0x0203,
        }
    }
}

/// Errors that can occur in bridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Bad per-viewer arguments at join time.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error on the upstream socket.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error reported by the RFB client library.
    #[error("upstream protocol error: {0}")]
    Upstream(#[from] vnc::VncError),

    /// Initial connect failed after all retries.
    #[error("upstream server not reachable after {attempts} attempt(s)")]
    UpstreamUnreachable {
        /// Number of connect attempts made.
        attempts: u32,
    },

    /// The upstream connection closed mid-session.
    #[error("connection closed")]
    Disconnected,

    /// A pixel buffer did not match its declared geometry.
    #[error("pixel translation error: {0}")]
    Translate(String),
}
