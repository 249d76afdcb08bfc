//! The [`KeyValueStore`] trait.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tracing::error;

use crate::error::StateResult;

/// A named table of JSON documents.
///
/// Implementors provide the fallible `try_*` primitives. Callers normally
/// use the provided fail-soft methods, which log backend failures and
/// return an empty document, `false` or an empty map instead.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Table name, for logging.
    fn name(&self) -> &str;

    async fn try_get(&self, key: &str) -> StateResult<Option<Value>>;

    async fn try_set(&self, key: &str, value: &Value) -> StateResult<()>;

    /// Returns whether the key existed.
    async fn try_delete(&self, key: &str) -> StateResult<bool>;

    async fn try_scan(&self) -> StateResult<BTreeMap<String, Value>>;

    /// The document under `key`, or an empty object when it is missing or
    /// the backend fails.
    async fn get(&self, key: &str) -> Value {
        match self.try_get(key).await {
            Ok(Some(value)) => value,
            Ok(None) => empty_document(),
            Err(e) => {
                error!(table = self.name(), key, error = %e, "key-value get failed");
                empty_document()
            }
        }
    }

    async fn set(&self, key: &str, value: &Value) -> bool {
        match self.try_set(key, value).await {
            Ok(()) => true,
            Err(e) => {
                error!(table = self.name(), key, error = %e, "key-value set failed");
                false
            }
        }
    }

    async fn delete(&self, key: &str) -> bool {
        match self.try_delete(key).await {
            Ok(_) => true,
            Err(e) => {
                error!(table = self.name(), key, error = %e, "key-value delete failed");
                false
            }
        }
    }

    async fn scan(&self) -> BTreeMap<String, Value> {
        match self.try_scan().await {
            Ok(entries) => entries,
            Err(e) => {
                error!(table = self.name(), error = %e, "key-value scan failed");
                BTreeMap::new()
            }
        }
    }
}

pub fn empty_document() -> Value {
    Value::Object(serde_json::Map::new())
}

/// True for the empty object returned for missing keys.
pub fn is_empty_document(value: &Value) -> bool {
    value.as_object().is_some_and(|map| map.is_empty()) || value.is_null()
}
