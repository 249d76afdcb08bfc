//! Error types for region updaters.

use thiserror::Error;

/// Result type alias for updater operations.
pub type UpdaterResult<T> = Result<T, UpdaterError>;

#[derive(Debug, Error)]
pub enum UpdaterError {
    #[error("unsupported region updater: {0}")]
    UnsupportedRegion(String),

    #[error("updater for {0} has no url")]
    MissingUrl(String),

    #[error("unknown timezone: {0}")]
    Timezone(String),

    #[error("download failed: {0}")]
    Download(#[from] reqwest::Error),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("invalid feed_info.txt: {0}")]
    FeedInfo(String),

    #[error("invalid versions response: {0}")]
    VersionsApi(String),

    #[error(transparent)]
    Registry(#[from] depot_versions::VersionError),
}
