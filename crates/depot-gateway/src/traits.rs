//! The actuator seams used by the version manager and update manager.

use std::collections::BTreeMap;

use async_trait::async_trait;
use depot_core::GatewayConfig;

use crate::error::GatewayResult;

/// Runs the worker serving one region prefix.
///
/// Every method is safe to retry: `start` converges the backend onto
/// `config`, `stop` on an unknown prefix is a logged no-op.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn start(&self, prefix: &str, config: &GatewayConfig) -> GatewayResult<()>;

    /// Restart the worker for `prefix` without changing its version.
    async fn recycle(&self, prefix: &str, config: &GatewayConfig) -> GatewayResult<()>;

    async fn stop(&self, prefix: &str) -> GatewayResult<()>;
}

/// Launches a one-shot import job.
#[async_trait]
pub trait Importer: Send + Sync {
    /// `env` is the importer environment; it must carry `PREFIX` and `VERSION`.
    async fn start_task(&self, env: BTreeMap<String, String>) -> GatewayResult<()>;
}
