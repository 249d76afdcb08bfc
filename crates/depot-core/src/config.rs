//! depot.toml configuration model.
//!
//! The file config is the base layer. CLI flags override a handful of
//! top-level fields, and the remote `config` document stored in the meta
//! table is shallow-merged over the result at startup (see
//! [`OrchestratorConfig::merge_remote`]).

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConfigError, ConfigResult};

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Control API listen port.
    pub port: u16,
    /// Key-value store backend.
    pub keyvalue: KeyValueKind,
    /// Prefix for the three table names (`{prefix}-versions` etc).
    pub keyvalue_prefix: String,
    /// Region of the remote key-value store.
    pub keyvalue_region: String,
    /// Endpoint override for the remote key-value store (e.g. LocalStack).
    pub keyvalue_endpoint: Option<String>,
    /// Directory holding the local key-value database.
    pub data_dir: PathBuf,
    /// Where workers fetch static assets from.
    pub storage_service: StorageService,
    pub transaction_limit: u32,
    /// Database connection timeout in milliseconds.
    pub connection_timeout: u64,
    /// Database request timeout in milliseconds.
    pub request_timeout: u64,
    /// Upstream API keys handed to workers, keyed by API name.
    pub api: BTreeMap<String, String>,
    /// Database server templates, keyed by template name.
    pub db: BTreeMap<String, DbTemplate>,
    pub redis: Option<RedisConfig>,
    /// Region updaters, keyed by region prefix.
    pub updaters: BTreeMap<String, UpdaterConfig>,
    /// Importer backend. Absent means imports are run by hand.
    pub importer: Option<ImporterConfig>,
    pub gateway: GatewayBackendConfig,
    /// Garbage-collect superseded versions.
    pub delete_old_versions: bool,
    /// Upper bound on concurrent work items per sweep.
    pub sweep_concurrency: usize,
    /// Image used when rendering a local `docker run` import command.
    pub importer_image: String,
    /// Container whose network the local importer joins.
    pub db_container: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            port: 9001,
            keyvalue: KeyValueKind::Local,
            keyvalue_prefix: "depot".to_string(),
            keyvalue_region: "us-west-2".to_string(),
            keyvalue_endpoint: None,
            data_dir: PathBuf::from("/var/lib/depot"),
            storage_service: StorageService::Aws,
            transaction_limit: 50_000,
            connection_timeout: 60_000,
            request_timeout: 60_000,
            api: BTreeMap::new(),
            db: BTreeMap::new(),
            redis: None,
            updaters: BTreeMap::new(),
            importer: None,
            gateway: GatewayBackendConfig::default(),
            delete_old_versions: false,
            sweep_concurrency: 4,
            importer_image: "depot/importer".to_string(),
            db_container: "depot-db".to_string(),
        }
    }
}

impl OrchestratorConfig {
    /// Load and validate a config file.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        debug!(?path, "config loaded");
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Shallow-merge a remote override document over this config.
    ///
    /// Each top-level key of `remote` replaces the local value wholesale.
    /// A missing or empty document leaves the config unchanged.
    pub fn merge_remote(&self, remote: &serde_json::Value) -> ConfigResult<Self> {
        let overrides = match remote.as_object() {
            Some(map) if !map.is_empty() => map,
            _ => return Ok(self.clone()),
        };

        let mut base =
            serde_json::to_value(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        if let Some(fields) = base.as_object_mut() {
            for (key, value) in overrides {
                fields.insert(key.clone(), value.clone());
            }
        }

        let merged: Self =
            serde_json::from_value(base).map_err(|e| ConfigError::Parse(e.to_string()))?;
        merged.validate()?;
        debug!(keys = overrides.len(), "remote config merged");
        Ok(merged)
    }

    /// Check the cross-field constraints serde cannot express.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.keyvalue_prefix.is_empty() {
            return Err(ConfigError::Invalid("keyvalue_prefix must not be empty".into()));
        }
        if self.sweep_concurrency == 0 {
            return Err(ConfigError::Invalid("sweep_concurrency must be at least 1".into()));
        }
        self.gateway.validate()?;
        if let Some(importer) = &self.importer {
            importer.validate()?;
        }
        Ok(())
    }

    /// Physical name of one of the key-value tables.
    pub fn table_name(&self, table: &str) -> String {
        format!("{}-{table}", self.keyvalue_prefix)
    }
}

/// Key-value store backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyValueKind {
    #[default]
    Local,
    Dynamo,
}

impl fmt::Display for KeyValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Dynamo => write!(f, "dynamo"),
        }
    }
}

/// Static asset storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageService {
    #[default]
    Aws,
    Local,
}

impl fmt::Display for StorageService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aws => write!(f, "aws"),
            Self::Local => write!(f, "local"),
        }
    }
}

/// Database server credentials. A version's database is a template plus
/// its own database name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbTemplate {
    pub server: String,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
}

// ── Updaters ───────────────────────────────────────────────────

/// Per-region updater settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Updater strategy: `basic` (the default) polls a static feed archive,
    /// a region code such as `nz-akl` selects that region's strategy.
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub enabled: bool,
    /// Feed archive (basic) or versions API (region-specific) URL.
    pub url: Option<String>,
    /// Minutes to wait before the first check.
    pub delay: u64,
    /// Minutes between checks.
    pub interval: u64,
    /// Database template name for discovered versions.
    pub dbconfig: String,
    pub shapes_container: String,
    pub shapes_region: String,
    /// IANA timezone the feed's validity dates are expressed in.
    pub timezone: String,
    /// Header carrying `api[prefix]` on upstream requests.
    pub api_key_header: Option<String>,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            kind: None,
            enabled: true,
            url: None,
            delay: 5,
            interval: 1440,
            dbconfig: String::new(),
            shapes_container: String::new(),
            shapes_region: String::new(),
            timezone: "Pacific/Auckland".to_string(),
            api_key_header: None,
        }
    }
}

// ── Importer ───────────────────────────────────────────────────

/// One-shot importer backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum ImporterConfig {
    Fargate(FargateImporterConfig),
    Kubernetes(KubernetesJobConfig),
}

impl ImporterConfig {
    fn validate(&self) -> ConfigResult<()> {
        match self {
            Self::Fargate(c) => {
                require("importer.cluster", &c.cluster)?;
                require("importer.region", &c.region)?;
                require("importer.task_definition", &c.task_definition)
            }
            Self::Kubernetes(c) => c.validate("importer"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FargateImporterConfig {
    pub cluster: String,
    pub region: String,
    pub task_definition: String,
    #[serde(default = "default_importer_container")]
    pub container_name: String,
    #[serde(default)]
    pub subnets: Vec<String>,
    #[serde(default)]
    pub security_groups: Vec<String>,
    #[serde(default)]
    pub assign_public_ip: bool,
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn default_importer_container() -> String {
    "importer".to_string()
}

/// Batch-job orchestrator coordinates, shared by the job importer and
/// the job gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesJobConfig {
    pub namespace: String,
    pub image: String,
    /// Secret holding the storage credentials injected into the job.
    pub secret: String,
    pub api_server: String,
    pub token_path: PathBuf,
    /// Job names are `{job_prefix}-{prefix}-{version}`.
    pub job_prefix: String,
    /// Per-request timeout against the API server, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for KubernetesJobConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            image: "depot/importer:latest".to_string(),
            secret: "depot-importer-aws".to_string(),
            api_server: "https://kubernetes.default.svc".to_string(),
            token_path: PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/token"),
            job_prefix: "depot-importer".to_string(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl KubernetesJobConfig {
    fn validate(&self, section: &str) -> ConfigResult<()> {
        require(&format!("{section}.namespace"), &self.namespace)?;
        require(&format!("{section}.image"), &self.image)?;
        require(&format!("{section}.api_server"), &self.api_server)?;
        if self.timeout_ms == 0 {
            return Err(ConfigError::Invalid(format!("{section}.timeout_ms must be positive")));
        }
        Ok(())
    }
}

// ── Gateway ────────────────────────────────────────────────────

/// Worker gateway backend, validated when the config is loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum GatewayBackendConfig {
    Local(LocalGatewayConfig),
    Ecs(EcsGatewayConfig),
    Kubernetes(KubernetesJobConfig),
}

impl Default for GatewayBackendConfig {
    fn default() -> Self {
        Self::Local(LocalGatewayConfig::default())
    }
}

impl GatewayBackendConfig {
    fn validate(&self) -> ConfigResult<()> {
        match self {
            Self::Local(c) => require("gateway.program", &c.program.to_string_lossy()),
            Self::Ecs(c) => {
                require("gateway.cluster", &c.cluster)?;
                require("gateway.region", &c.region)?;
                if c.replicas < 0 {
                    return Err(ConfigError::Invalid("gateway.replicas must not be negative".into()));
                }
                Ok(())
            }
            Self::Kubernetes(c) => c.validate("gateway"),
        }
    }
}

/// Spawns workers as child processes on this host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalGatewayConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub host: String,
    /// Workers listen on `base_port + n` in start order.
    pub base_port: u16,
}

impl Default for LocalGatewayConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("depot-worker"),
            args: Vec::new(),
            host: "127.0.0.1".to_string(),
            base_port: 9100,
        }
    }
}

/// Managed container service; one service per region prefix named
/// `{service_prefix}{prefix}{service_suffix}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EcsGatewayConfig {
    pub cluster: String,
    pub region: String,
    #[serde(default)]
    pub service_prefix: String,
    #[serde(default)]
    pub service_suffix: String,
    #[serde(default = "default_replicas")]
    pub replicas: i32,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl EcsGatewayConfig {
    pub fn service_name(&self, prefix: &str) -> String {
        format!("{}{prefix}{}", self.service_prefix, self.service_suffix)
    }
}

const fn default_replicas() -> i32 {
    1
}

const fn default_timeout_ms() -> u64 {
    60_000
}

fn require(field: &str, value: &str) -> ConfigResult<()> {
    if value.trim().is_empty() {
        return Err(ConfigError::Invalid(format!("{field} is required")));
    }
    Ok(())
}
