//! Error types for proxies and the registry.

use std::net::SocketAddr;

use thiserror::Error;
use toxide_core::ToxicError;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// A proxy with this name or listen address already exists.
    #[error("proxy already exists: {0}")]
    ProxyExists(String),

    /// No proxy with this name.
    #[error("proxy not found: {0}")]
    NotFound(String),

    /// Missing or malformed proxy fields.
    #[error("invalid proxy config: {0}")]
    InvalidConfig(String),

    /// The listen address could not be resolved.
    #[error("invalid listen address {addr}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    /// The name filter is not a valid regular expression.
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// Toxic error.
    #[error(transparent)]
    Toxic(#[from] ToxicError),

    /// Failed to bind the listen socket.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
