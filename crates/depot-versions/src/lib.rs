//! depot-versions: the version registry.
//!
//! [`VersionManager`] owns the `versions` and `mappings` tables and is the
//! only component that drives a [`depot_gateway::Gateway`]. Actuations for
//! the same prefix are serialized through [`PrefixLocks`]; different
//! prefixes proceed concurrently.

pub mod admin;
pub mod error;
pub mod locks;
pub mod manager;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use admin::{DatabaseAdmin, PostgresAdmin};
pub use error::{VersionError, VersionResult};
pub use locks::PrefixLocks;
pub use manager::{VersionCheck, VersionManager, VersionSummary};
