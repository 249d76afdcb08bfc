//! In-memory doubles for the gateway, importer and database admin seams.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use depot_core::{DbConfig, GatewayConfig};
use depot_gateway::{Gateway, GatewayError, GatewayResult, Importer};
use depot_state::{KeyValueStore, is_empty_document};

use crate::error::{VersionError, VersionResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    Start { prefix: String, id: String },
    Recycle { prefix: String, id: String },
    Stop { prefix: String },
}

/// Records every gateway call. When observing a mappings table it also
/// records whether the prefix was already mapped when `start` ran.
#[derive(Default)]
pub struct RecordingGateway {
    calls: Mutex<Vec<GatewayCall>>,
    mapping_seen: Mutex<Vec<bool>>,
    mappings: Option<Arc<dyn KeyValueStore>>,
}

impl RecordingGateway {
    pub fn observing(mappings: Arc<dyn KeyValueStore>) -> Self {
        Self {
            mappings: Some(mappings),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn mapping_seen_at_start(&self) -> Vec<bool> {
        self.mapping_seen.lock().expect("mapping lock").clone()
    }

    pub fn starts_for(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, GatewayCall::Start { prefix: p, .. } if p == prefix))
            .count()
    }
}

#[async_trait]
impl Gateway for RecordingGateway {
    async fn start(&self, prefix: &str, config: &GatewayConfig) -> GatewayResult<()> {
        if let Some(mappings) = &self.mappings {
            let doc = mappings.get(prefix).await;
            let seen = !is_empty_document(&doc) && doc["value"] == config.id.as_str();
            self.mapping_seen.lock().expect("mapping lock").push(seen);
        }
        self.calls.lock().expect("calls lock").push(GatewayCall::Start {
            prefix: prefix.to_string(),
            id: config.id.clone(),
        });
        Ok(())
    }

    async fn recycle(&self, prefix: &str, config: &GatewayConfig) -> GatewayResult<()> {
        self.calls.lock().expect("calls lock").push(GatewayCall::Recycle {
            prefix: prefix.to_string(),
            id: config.id.clone(),
        });
        Ok(())
    }

    async fn stop(&self, prefix: &str) -> GatewayResult<()> {
        self.calls.lock().expect("calls lock").push(GatewayCall::Stop {
            prefix: prefix.to_string(),
        });
        Ok(())
    }
}

/// Records submitted import environments; can be told to fail.
#[derive(Default)]
pub struct RecordingImporter {
    tasks: Mutex<Vec<BTreeMap<String, String>>>,
    failing: Mutex<bool>,
}

impl RecordingImporter {
    pub fn tasks(&self) -> Vec<BTreeMap<String, String>> {
        self.tasks.lock().expect("tasks lock").clone()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().expect("failing lock") = failing;
    }
}

#[async_trait]
impl Importer for RecordingImporter {
    async fn start_task(&self, env: BTreeMap<String, String>) -> GatewayResult<()> {
        if *self.failing.lock().expect("failing lock") {
            return Err(GatewayError::backend("importer unavailable"));
        }
        self.tasks.lock().expect("tasks lock").push(env);
        Ok(())
    }
}

/// Pretends every database exists and drops it, unless told to fail.
#[derive(Default)]
pub struct FakeDatabaseAdmin {
    dropped: Mutex<Vec<String>>,
    fail_next: Mutex<bool>,
}

impl FakeDatabaseAdmin {
    pub fn dropped(&self) -> Vec<String> {
        self.dropped.lock().expect("dropped lock").clone()
    }

    pub fn fail_next(&self) {
        *self.fail_next.lock().expect("fail lock") = true;
    }
}

#[async_trait]
impl crate::admin::DatabaseAdmin for FakeDatabaseAdmin {
    async fn drop_database(&self, db: &DbConfig) -> VersionResult<bool> {
        {
            let mut fail = self.fail_next.lock().expect("fail lock");
            if *fail {
                *fail = false;
                return Err(VersionError::Database(format!("cannot drop {}", db.database)));
            }
        }
        self.dropped
            .lock()
            .expect("dropped lock")
            .push(db.database.clone());
        Ok(true)
    }
}
