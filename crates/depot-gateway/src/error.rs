//! Error types for gateways and importers.

use thiserror::Error;

/// Result type alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("backend error: {0}")]
    Backend(String),

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    #[error("kubernetes api returned {status}: {body}")]
    Kubernetes { status: u16, body: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("missing environment variable: {0}")]
    MissingEnv(&'static str),
}

impl GatewayError {
    #[must_use]
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}
