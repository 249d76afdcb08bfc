//! The three orchestrator tables, opened from configuration.

use std::sync::Arc;

use depot_core::{KeyValueKind, OrchestratorConfig};
use tracing::info;

use crate::dynamo::{DynamoConfig, DynamoKeyValue};
use crate::error::{StateError, StateResult};
use crate::kv::KeyValueStore;
use crate::local::LocalDatabase;

pub const VERSIONS: &str = "versions";
pub const MAPPINGS: &str = "mappings";
pub const META: &str = "meta";

/// Handles to the `versions`, `mappings` and `meta` tables.
#[derive(Clone)]
pub struct Tables {
    pub versions: Arc<dyn KeyValueStore>,
    pub mappings: Arc<dyn KeyValueStore>,
    pub meta: Arc<dyn KeyValueStore>,
}

impl Tables {
    /// Open the tables selected by `config.keyvalue`.
    pub async fn open(config: &OrchestratorConfig) -> StateResult<Self> {
        match config.keyvalue {
            KeyValueKind::Local => {
                std::fs::create_dir_all(&config.data_dir)
                    .map_err(|e| StateError::Open(e.to_string()))?;
                let path = config.data_dir.join("depot.redb");
                let db = LocalDatabase::open(&path)?;
                info!(path = ?path, "using local key-value tables");
                Self::local(&db, &config.keyvalue_prefix)
            }
            KeyValueKind::Dynamo => {
                let sdk_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
                info!(region = %config.keyvalue_region, "using dynamo key-value tables");
                Ok(Self::dynamo(&sdk_config, config))
            }
        }
    }

    pub fn local(db: &LocalDatabase, prefix: &str) -> StateResult<Self> {
        Ok(Self {
            versions: Arc::new(db.table(&format!("{prefix}-{VERSIONS}"))?),
            mappings: Arc::new(db.table(&format!("{prefix}-{MAPPINGS}"))?),
            meta: Arc::new(db.table(&format!("{prefix}-{META}"))?),
        })
    }

    /// Fresh in-memory tables (for testing).
    pub fn in_memory() -> StateResult<Self> {
        Self::local(&LocalDatabase::open_in_memory()?, "depot")
    }

    pub fn dynamo(sdk_config: &aws_config::SdkConfig, config: &OrchestratorConfig) -> Self {
        let table = |name: &str| -> Arc<dyn KeyValueStore> {
            Arc::new(DynamoKeyValue::new(
                sdk_config,
                DynamoConfig {
                    table_name: config.table_name(name),
                    region: Some(config.keyvalue_region.clone()),
                    endpoint: config.keyvalue_endpoint.clone(),
                    timeout_ms: Some(config.request_timeout),
                },
            ))
        };
        Self {
            versions: table(VERSIONS),
            mappings: table(MAPPINGS),
            meta: table(META),
        }
    }
}
