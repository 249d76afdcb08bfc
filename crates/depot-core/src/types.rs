//! Persisted records and the derived gateway configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::{DbTemplate, KeyValueKind, OrchestratorConfig, RedisConfig, StorageService};

static SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_]").expect("separator pattern is valid"));

/// Deterministic version id: sanitized prefix and version joined by `_`.
///
/// Every character outside `[A-Za-z0-9_]` becomes `_`, so the id doubles
/// as a safe database name.
pub fn version_id(prefix: &str, version: &str) -> String {
    format!(
        "{}_{}",
        SEPARATOR.replace_all(prefix, "_"),
        SEPARATOR.replace_all(version, "_")
    )
}

// ── Status ─────────────────────────────────────────────────────

/// Lifecycle status of a dataset version.
///
/// ```text
/// empty -> pendingimport         -> importing         -> imported
/// empty -> pendingimport-willmap -> importing-willmap -> imported-willmap -> imported
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VersionStatus {
    #[serde(rename = "empty")]
    Empty,
    #[serde(rename = "pendingimport")]
    PendingImport,
    #[serde(rename = "pendingimport-willmap")]
    PendingImportWillMap,
    #[serde(rename = "importing")]
    Importing,
    #[serde(rename = "importing-willmap")]
    ImportingWillMap,
    #[serde(rename = "imported")]
    Imported,
    #[serde(rename = "imported-willmap")]
    ImportedWillMap,
}

impl VersionStatus {
    pub const ALL: [Self; 7] = [
        Self::Empty,
        Self::PendingImport,
        Self::PendingImportWillMap,
        Self::Importing,
        Self::ImportingWillMap,
        Self::Imported,
        Self::ImportedWillMap,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::PendingImport => "pendingimport",
            Self::PendingImportWillMap => "pendingimport-willmap",
            Self::Importing => "importing",
            Self::ImportingWillMap => "importing-willmap",
            Self::Imported => "imported",
            Self::ImportedWillMap => "imported-willmap",
        }
    }

    /// The pending status a fresh version moves to.
    pub fn pending(will_map: bool) -> Self {
        if will_map {
            Self::PendingImportWillMap
        } else {
            Self::PendingImport
        }
    }

    pub fn is_pending_import(self) -> bool {
        matches!(self, Self::PendingImport | Self::PendingImportWillMap)
    }

    pub fn is_imported(self) -> bool {
        matches!(self, Self::Imported | Self::ImportedWillMap)
    }

    /// Whether `next` is a documented successor of `self`.
    ///
    /// Rewriting the same status and promoting a pending version to its
    /// willmap variant both count as documented.
    pub fn can_transition_to(self, next: Self) -> bool {
        use VersionStatus::*;
        self == next
            || matches!(
                (self, next),
                (Empty, PendingImport)
                    | (Empty, PendingImportWillMap)
                    | (PendingImport, PendingImportWillMap)
                    | (PendingImport, Importing)
                    | (PendingImportWillMap, ImportingWillMap)
                    | (Importing, Imported)
                    | (ImportingWillMap, ImportedWillMap)
                    | (ImportedWillMap, Imported)
            )
    }
}

impl fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown version status: {0}")]
pub struct ParseStatusError(pub String);

impl FromStr for VersionStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseStatusError(s.to_string()))
    }
}

// ── Records ────────────────────────────────────────────────────

/// Database coordinates of one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbConfig {
    pub server: String,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl DbConfig {
    pub fn from_template(template: &DbTemplate, database: impl Into<String>) -> Self {
        Self {
            server: template.server.clone(),
            user: template.user.clone(),
            password: template.password.clone(),
            database: database.into(),
        }
    }
}

/// One dataset release for one region, stored in the `versions` table
/// under its [`version_id`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Version {
    pub prefix: String,
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub shapes_container: String,
    #[serde(default)]
    pub shapes_region: String,
    pub status: VersionStatus,
    pub db: DbConfig,
    #[serde(default)]
    pub new_realtime: bool,
}

/// Fields supplied when registering a version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewVersion {
    pub prefix: String,
    pub version: String,
    #[serde(default)]
    pub shapes_container: String,
    #[serde(default)]
    pub shapes_region: String,
    /// Name of the database template in [`OrchestratorConfig::db`].
    pub dbconfig: String,
    #[serde(default)]
    pub new_realtime: bool,
}

/// Stored in the `mappings` table under the region prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    /// Id of the live version.
    pub value: String,
}

// ── Gateway config ─────────────────────────────────────────────

/// Database section of a [`GatewayConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayDbConfig {
    pub server: String,
    pub user: String,
    pub password: String,
    pub database: String,
    pub transaction_limit: u32,
    pub connection_timeout: u64,
    pub request_timeout: u64,
}

/// Everything a gateway or importer needs to run one version.
///
/// Synthesized from the orchestrator config and a [`Version`] on every
/// actuation; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    pub id: String,
    pub prefix: String,
    pub version: String,
    pub status: VersionStatus,
    pub storage_service: StorageService,
    pub shapes_container: String,
    pub shapes_region: String,
    pub api: BTreeMap<String, String>,
    pub new_realtime: bool,
    pub redis: Option<RedisConfig>,
    pub db: GatewayDbConfig,
    pub keyvalue: KeyValueKind,
    pub keyvalue_prefix: String,
    pub keyvalue_region: String,
}

impl GatewayConfig {
    pub fn synthesize(id: &str, version: &Version, config: &OrchestratorConfig) -> Self {
        Self {
            id: id.to_string(),
            prefix: version.prefix.clone(),
            version: version.version.clone(),
            status: version.status,
            storage_service: config.storage_service,
            shapes_container: version.shapes_container.clone(),
            shapes_region: version.shapes_region.clone(),
            api: config.api.clone(),
            new_realtime: version.new_realtime,
            redis: config.redis.clone(),
            db: GatewayDbConfig {
                server: version.db.server.clone(),
                user: version.db.user.clone(),
                password: version.db.password.clone(),
                database: version.db.database.clone(),
                transaction_limit: config.transaction_limit,
                connection_timeout: config.connection_timeout,
                request_timeout: config.request_timeout,
            },
            keyvalue: config.keyvalue,
            keyvalue_prefix: config.keyvalue_prefix.clone(),
            keyvalue_region: config.keyvalue_region.clone(),
        }
    }
}
