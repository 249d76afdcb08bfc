//! redb-backed tables.
//!
//! All tables of one orchestrator live in a single redb database. Values
//! are JSON-serialized into `&[u8]` columns keyed by `&str`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, TableError};
use serde_json::Value;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::kv::KeyValueStore;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Shared handle to the redb database holding every local table.
#[derive(Clone)]
pub struct LocalDatabase {
    db: Arc<Database>,
}

impl LocalDatabase {
    /// Open (or create) a persistent database at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        debug!(?path, "local key-value database opened");
        Ok(Self { db: Arc::new(db) })
    }

    /// Create an ephemeral in-memory database (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Open the named table, creating it if absent.
    pub fn table(&self, name: &str) -> StateResult<LocalKeyValue> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(definition(name)).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(LocalKeyValue {
            db: self.db.clone(),
            name: name.to_string(),
        })
    }
}

fn definition(name: &str) -> TableDefinition<'_, &'static str, &'static [u8]> {
    TableDefinition::new(name)
}

/// One table inside a [`LocalDatabase`].
#[derive(Clone)]
pub struct LocalKeyValue {
    db: Arc<Database>,
    name: String,
}

#[async_trait]
impl KeyValueStore for LocalKeyValue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn try_get(&self, key: &str) -> StateResult<Option<Value>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = match txn.open_table(definition(&self.name)) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(StateError::Table(e.to_string())),
        };
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn try_set(&self, key: &str, value: &Value) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn
                .open_table(definition(&self.name))
                .map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(table = %self.name, %key, "document stored");
        Ok(())
    }

    async fn try_delete(&self, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn
                .open_table(definition(&self.name))
                .map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(table = %self.name, %key, existed, "document deleted");
        Ok(existed)
    }

    async fn try_scan(&self) -> StateResult<BTreeMap<String, Value>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = match txn.open_table(definition(&self.name)) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(BTreeMap::new()),
            Err(e) => return Err(StateError::Table(e.to_string())),
        };
        let mut results = BTreeMap::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let doc: Value = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.insert(key.value().to_string(), doc);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::kv::is_empty_document;

    fn test_table(name: &str) -> LocalKeyValue {
        LocalDatabase::open_in_memory().unwrap().table(name).unwrap()
    }

    #[tokio::test]
    async fn missing_key_is_empty_document() {
        let table = test_table("depot-versions");
        let value = table.get("nope").await;
        assert!(is_empty_document(&value));
        assert_eq!(table.try_get("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn nested_documents_survive() {
        let table = test_table("depot-versions");
        let doc = json!({
            "prefix": "nz-akl",
            "db": { "server": "db", "database": "nz_akl_v1" },
            "tags": [1, "two", { "three": 3.5 }],
            "newRealtime": true,
        });
        assert!(table.set("nz_akl_v1", &doc).await);
        assert_eq!(table.get("nz_akl_v1").await, doc);
    }

    #[tokio::test]
    async fn set_overwrites_and_delete_removes() {
        let table = test_table("depot-mappings");
        table.set("nz-akl", &json!({ "value": "a" })).await;
        table.set("nz-akl", &json!({ "value": "b" })).await;
        assert_eq!(table.get("nz-akl").await["value"], "b");

        assert!(table.try_delete("nz-akl").await.unwrap());
        assert!(!table.try_delete("nz-akl").await.unwrap());
        // The fail-soft delete only reports backend failure.
        assert!(table.delete("nz-akl").await);
    }

    #[tokio::test]
    async fn scan_returns_only_own_table() {
        let db = LocalDatabase::open_in_memory().unwrap();
        let versions = db.table("depot-versions").unwrap();
        let mappings = db.table("depot-mappings").unwrap();

        versions.set("a", &json!({ "n": 1 })).await;
        versions.set("b", &json!({ "n": 2 })).await;
        mappings.set("nz-akl", &json!({ "value": "a" })).await;

        let all = versions.scan().await;
        assert_eq!(all.len(), 2);
        assert_eq!(all["b"]["n"], 2);
        assert_eq!(mappings.scan().await.len(), 1);
    }

    #[tokio::test]
    async fn persistent_database_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("depot.redb");

        {
            let db = LocalDatabase::open(&path).unwrap();
            let meta = db.table("depot-meta").unwrap();
            meta.set("config", &json!({ "delete_old_versions": true })).await;
        }

        let db = LocalDatabase::open(&path).unwrap();
        let meta = db.table("depot-meta").unwrap();
        assert_eq!(meta.get("config").await["delete_old_versions"], true);
    }
}
