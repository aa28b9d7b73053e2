//! Centralized error types for the gateway

use thiserror::Error;

/// Gateway error types
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Upstream refused the connection or is otherwise unreachable
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Upstream did not answer within the configured timeout
    #[error("Upstream timed out after {0}ms")]
    UpstreamTimeout(u64),

    /// A child service process could not be launched
    #[error("Failed to spawn service '{service}': {reason}")]
    Spawn { service: String, reason: String },

    /// Every candidate listen port was already in use
    #[error("No free port in range {first}..={last}")]
    PortsExhausted { first: u16, last: u16 },

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Convenience Result type alias
pub type Result<T> = std::result::Result<T, GatewayError>;
