//! Error types for gateway-rs

use thiserror::Error;

use crate::policy::Denial;
use crate::store::StoreError;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Gateway error types
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Routing store error
    #[error("Routing store error: {0}")]
    Store(#[from] StoreError),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Host is not allowed to obtain a certificate
    #[error("Certificate for {host} denied: {reason}")]
    HostDenied { host: String, reason: Denial },

    /// Certificate issuance failed
    #[error("Certificate issuance failed: {0}")]
    Issuance(String),

    /// Listener could not be bound
    #[error("Could not bind {name} listener on {addr}: {source}")]
    Bind {
        name: &'static str,
        addr: String,
        source: std::io::Error,
    },

    /// A listener stopped serving
    #[error("{0} listener exited")]
    ListenerExited(&'static str),
}
