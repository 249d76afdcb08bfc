//! VersionManager: registry of dataset versions and prefix mappings.
//!
//! Status flow:
//!
//! ```text
//! empty -> pendingimport         -> importing         -> imported
//! empty -> pendingimport-willmap -> importing-willmap -> imported-willmap -> imported
//! ```
//!
//! Status writes are last-write-wins per version. Gateway actuation for a
//! prefix (`update_mapping`, `delete_mapping`, `recycle_gateway`,
//! `stop_gateway`) holds that prefix's lock for the whole write-then-actuate
//! sequence.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use depot_core::{
    DbConfig, GatewayConfig, Mapping, NewVersion, OrchestratorConfig, Version, VersionStatus,
    docker_command, version_id,
};
use depot_gateway::Gateway;
use depot_state::{KeyValueStore, Tables, is_empty_document};
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::admin::DatabaseAdmin;
use crate::error::{VersionError, VersionResult};
use crate::locks::PrefixLocks;

/// Result of [`VersionManager::check_version_exists`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionCheck {
    pub id: String,
    pub exists: bool,
}

/// Row of the worker listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionSummary {
    pub id: String,
    pub prefix: String,
    pub status: VersionStatus,
    pub version: String,
    pub dbname: String,
}

pub struct VersionManager {
    config: Arc<OrchestratorConfig>,
    versions: Arc<dyn KeyValueStore>,
    mappings: Arc<dyn KeyValueStore>,
    gateway: Arc<dyn Gateway>,
    db_admin: Arc<dyn DatabaseAdmin>,
    locks: PrefixLocks,
}

impl VersionManager {
    pub fn new(
        config: Arc<OrchestratorConfig>,
        tables: &Tables,
        gateway: Arc<dyn Gateway>,
        db_admin: Arc<dyn DatabaseAdmin>,
    ) -> Self {
        Self {
            config,
            versions: tables.versions.clone(),
            mappings: tables.mappings.clone(),
            gateway,
            db_admin,
            locks: PrefixLocks::new(),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Replay every stored mapping into the gateway.
    pub async fn start(&self) {
        info!("starting version manager");
        let mappings = self.all_mappings().await;
        info!(count = mappings.len(), "found mappings");

        join_all(mappings.into_iter().map(|(prefix, mapping)| async move {
            let _guard = self.locks.lock(&prefix).await;
            if let Err(e) = self.actuate(&prefix, &mapping.value).await {
                error!(%prefix, version = %mapping.value, error = %e, "could not start gateway");
            }
        }))
        .await;
    }

    /// Stop the gateway of every mapped prefix.
    pub async fn stop(&self) {
        for prefix in self.all_mappings().await.into_keys() {
            if let Err(e) = self.stop_gateway(&prefix).await {
                error!(%prefix, error = %e, "could not stop gateway");
            }
        }
    }

    // ── Versions ───────────────────────────────────────────────

    /// Register a version with status `empty`.
    ///
    /// Returns the new id, or `None` when `dbconfig` names no configured
    /// database template; nothing is written in that case.
    pub async fn add_version(&self, new: &NewVersion) -> VersionResult<Option<String>> {
        let id = version_id(&new.prefix, &new.version);
        let Some(template) = self.config.db.get(&new.dbconfig) else {
            error!(prefix = %new.prefix, dbconfig = %new.dbconfig, "no database config, could not create worker");
            return Ok(None);
        };

        let now = Utc::now();
        let version = Version {
            prefix: new.prefix.clone(),
            version: new.version.clone(),
            created_at: now,
            updated_at: now,
            shapes_container: new.shapes_container.clone(),
            shapes_region: new.shapes_region.clone(),
            status: VersionStatus::Empty,
            db: DbConfig::from_template(template, id.clone()),
            new_realtime: new.new_realtime,
        };
        self.put_version(&id, &version).await?;
        info!(prefix = %new.prefix, %id, "version added");
        Ok(Some(id))
    }

    pub async fn check_version_exists(&self, prefix: &str, version: &str) -> VersionCheck {
        let id = version_id(prefix, version);
        let exists = !is_empty_document(&self.versions.get(&id).await);
        VersionCheck { id, exists }
    }

    /// The stored version, or `None` if absent.
    pub async fn find_version(&self, id: &str) -> VersionResult<Option<Version>> {
        let doc = self.versions.get(id).await;
        if is_empty_document(&doc) {
            return Ok(None);
        }
        serde_json::from_value(doc)
            .map(Some)
            .map_err(|e| VersionError::Corrupt {
                id: id.to_string(),
                reason: e.to_string(),
            })
    }

    pub async fn get_version(&self, id: &str) -> VersionResult<Version> {
        self.find_version(id)
            .await?
            .ok_or_else(|| VersionError::VersionNotFound(id.to_string()))
    }

    /// Derive the gateway configuration for a version. Never writes.
    pub async fn get_version_config(&self, id: &str) -> VersionResult<GatewayConfig> {
        let version = self.get_version(id).await?;
        let config = GatewayConfig::synthesize(id, &version, &self.config);
        debug!(%id, prefix = %config.prefix, "gateway config");
        Ok(config)
    }

    /// Overwrite the status of a version.
    ///
    /// Any status is accepted; transitions outside the documented flow are
    /// logged.
    pub async fn update_version_status(&self, id: &str, status: VersionStatus) -> VersionResult<()> {
        let mut version = self.get_version(id).await?;
        if !version.status.can_transition_to(status) {
            warn!(%id, from = %version.status, to = %status, "undocumented status transition");
        }
        version.status = status;
        version.updated_at = Utc::now();
        self.put_version(id, &version).await?;
        info!(%id, %status, "version status updated");
        Ok(())
    }

    /// Drop a version's database, then delete its record.
    ///
    /// If the drop fails the record is kept and the error returned.
    pub async fn delete_worker(&self, id: &str) -> VersionResult<()> {
        let version = self.get_version(id).await?;
        self.db_admin.drop_database(&version.db).await?;
        self.versions
            .try_delete(id)
            .await
            .map_err(|e| VersionError::Storage(e.to_string()))?;
        info!(%id, prefix = %version.prefix, "version deleted");
        Ok(())
    }

    pub async fn all_versions(&self) -> BTreeMap<String, Version> {
        decode_all(self.versions.scan().await, "version")
    }

    pub async fn summaries(&self) -> Vec<VersionSummary> {
        self.all_versions()
            .await
            .into_iter()
            .map(|(id, v)| VersionSummary {
                id,
                prefix: v.prefix,
                status: v.status,
                version: v.version,
                dbname: v.db.database,
            })
            .collect()
    }

    pub async fn docker_command(&self, id: &str) -> VersionResult<String> {
        let config = self.get_version_config(id).await?;
        Ok(docker_command(
            &config,
            &self.config.importer_image,
            &self.config.db_container,
        ))
    }

    // ── Mappings ───────────────────────────────────────────────

    pub async fn all_mappings(&self) -> BTreeMap<String, Mapping> {
        decode_all(self.mappings.scan().await, "mapping")
    }

    /// Id of the version mapped to `prefix`.
    pub async fn mapped_version(&self, prefix: &str) -> Option<String> {
        let doc = self.mappings.get(prefix).await;
        serde_json::from_value::<Mapping>(doc).ok().map(|m| m.value)
    }

    /// Map `prefix` to version `id` and start its gateway.
    ///
    /// The version must exist. The mapping is visible before the gateway
    /// is started, and the gateway is started exactly once.
    pub async fn update_mapping(&self, prefix: &str, id: &str) -> VersionResult<()> {
        let _guard = self.locks.lock(prefix).await;
        let config = self.get_version_config(id).await?;
        self.put_mapping(prefix, id).await?;
        info!(prefix, version = %config.version, "updating gateway");
        self.gateway.start(prefix, &config).await?;
        Ok(())
    }

    /// Stop the gateway for `prefix` and remove its mapping.
    pub async fn delete_mapping(&self, prefix: &str) -> VersionResult<()> {
        let _guard = self.locks.lock(prefix).await;
        info!(prefix, "stopping gateway");
        self.gateway.stop(prefix).await?;
        self.mappings
            .try_delete(prefix)
            .await
            .map_err(|e| VersionError::Storage(e.to_string()))?;
        info!(prefix, "mapping deleted");
        Ok(())
    }

    pub async fn recycle_gateway(&self, prefix: &str) -> VersionResult<()> {
        let _guard = self.locks.lock(prefix).await;
        let Some(id) = self.mapped_version(prefix).await else {
            warn!(prefix, "no mapping, nothing to recycle");
            return Ok(());
        };
        let config = self.get_version_config(&id).await?;
        info!(prefix, %id, "recycling gateway");
        self.gateway.recycle(prefix, &config).await?;
        Ok(())
    }

    pub async fn stop_gateway(&self, prefix: &str) -> VersionResult<()> {
        let _guard = self.locks.lock(prefix).await;
        if self.mapped_version(prefix).await.is_none() {
            warn!(prefix, "no mapping, nothing to stop");
            return Ok(());
        }
        info!(prefix, "stopping gateway");
        self.gateway.stop(prefix).await?;
        Ok(())
    }

    // ── Internals ──────────────────────────────────────────────

    /// Start the gateway for an existing mapping. Caller holds the lock.
    async fn actuate(&self, prefix: &str, id: &str) -> VersionResult<()> {
        let config = self.get_version_config(id).await?;
        info!(prefix, version = %config.version, "updating gateway");
        self.gateway.start(prefix, &config).await?;
        Ok(())
    }

    async fn put_version(&self, id: &str, version: &Version) -> VersionResult<()> {
        let doc = serde_json::to_value(version).map_err(|e| VersionError::Storage(e.to_string()))?;
        self.versions
            .try_set(id, &doc)
            .await
            .map_err(|e| VersionError::Storage(e.to_string()))
    }

    async fn put_mapping(&self, prefix: &str, id: &str) -> VersionResult<()> {
        let doc = serde_json::to_value(Mapping {
            value: id.to_string(),
        })
        .map_err(|e| VersionError::Storage(e.to_string()))?;
        self.mappings
            .try_set(prefix, &doc)
            .await
            .map_err(|e| VersionError::Storage(e.to_string()))
    }
}

fn decode_all<T: serde::de::DeserializeOwned>(
    entries: BTreeMap<String, Value>,
    kind: &'static str,
) -> BTreeMap<String, T> {
    entries
        .into_iter()
        .filter_map(|(key, doc)| match serde_json::from_value(doc) {
            Ok(record) => Some((key, record)),
            Err(e) => {
                warn!(%key, kind, error = %e, "skipping unreadable record");
                None
            }
        })
        .collect()
}
