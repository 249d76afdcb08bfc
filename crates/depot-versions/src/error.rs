//! Error types for the version manager.

use depot_gateway::GatewayError;
use thiserror::Error;

/// Result type alias for version manager operations.
pub type VersionResult<T> = Result<T, VersionError>;

#[derive(Debug, Error)]
pub enum VersionError {
    #[error("version not found: {0}")]
    VersionNotFound(String),

    #[error("version record {id} is unreadable: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("storage error: {0}")]
    Storage(String),

    /// Dropping a version's database failed; the version record is kept.
    #[error("database error: {0}")]
    Database(String),

    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
}

impl From<sqlx::Error> for VersionError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}
