//! depot-updater: discovery of new dataset versions and the sweeps that
//! carry them into production.
//!
//! Each enabled region runs a [`RegionUpdater`] on its own timer and
//! reports [`DiscoveredVersion`]s over a channel. The [`UpdateManager`]
//! consumes that channel, applies the intake transitions, and runs two
//! periodic sweeps:
//!
//! - import sweep: start imports for pending versions, promote
//!   `imported-willmap` versions
//! - old-version sweep: delete imported versions superseded for at least
//!   a week

pub mod auckland;
pub mod basic;
pub mod error;
pub mod feed;
pub mod manager;
pub mod registry;
pub mod runner;

use async_trait::async_trait;

pub use auckland::AucklandUpdater;
pub use basic::BasicUpdater;
pub use error::{UpdaterError, UpdaterResult};
pub use manager::{SweepSchedule, UpdateManager};
pub use registry::{UpdaterKind, build_updaters};
pub use runner::{UpdaterSchedule, run_updater};

/// A version reported by an updater.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredVersion {
    pub prefix: String,
    pub version: String,
    /// The feed is valid right now; map it as soon as it is imported.
    pub auto_promote: bool,
}

/// Polling strategy for one region.
#[async_trait]
pub trait RegionUpdater: Send + Sync {
    fn prefix(&self) -> &str;

    /// Look upstream once and report what is currently published.
    async fn check(&self) -> UpdaterResult<Vec<DiscoveredVersion>>;
}
