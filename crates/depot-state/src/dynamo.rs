//! DynamoDB-backed tables.
//!
//! Each logical table is one DynamoDB table with a string hash key `id`.
//! A document's top-level fields are stored as item attributes; nested
//! objects and arrays become `M` and `L` attributes and numbers become
//! `N`, so documents round-trip without loss.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::error::DisplayErrorContext;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_smithy_types::timeout::TimeoutConfig;
use serde_json::{Map, Number, Value};
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::kv::KeyValueStore;

/// Hash key attribute name.
const KEY_ATTR: &str = "id";

/// DynamoDB table configuration.
#[derive(Debug, Clone)]
pub struct DynamoConfig {
    pub table_name: String,
    /// Region override (uses SDK default if not specified).
    pub region: Option<String>,
    /// Endpoint override (e.g. LocalStack).
    pub endpoint: Option<String>,
    /// Operation timeout in milliseconds.
    pub timeout_ms: Option<u64>,
}

#[derive(Clone)]
pub struct DynamoKeyValue {
    client: Client,
    table_name: String,
}

impl std::fmt::Debug for DynamoKeyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamoKeyValue")
            .field("table_name", &self.table_name)
            .finish()
    }
}

impl DynamoKeyValue {
    pub fn new(sdk_config: &aws_config::SdkConfig, config: DynamoConfig) -> Self {
        let mut builder = aws_sdk_dynamodb::config::Builder::from(sdk_config);

        if let Some(region) = config.region {
            builder = builder.region(aws_sdk_dynamodb::config::Region::new(region));
        }
        if let Some(endpoint) = config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        if let Some(timeout_ms) = config.timeout_ms {
            let timeout_config = TimeoutConfig::builder()
                .operation_timeout(Duration::from_millis(timeout_ms))
                .build();
            builder = builder.timeout_config(timeout_config);
        }

        Self::from_client(Client::from_conf(builder.build()), config.table_name)
    }

    /// Create from a pre-built client (for testing).
    pub fn from_client(client: Client, table_name: String) -> Self {
        Self { client, table_name }
    }
}

fn remote_err<E>(e: E) -> StateError
where
    E: std::error::Error + 'static,
{
    StateError::Remote(DisplayErrorContext(e).to_string())
}

#[async_trait]
impl KeyValueStore for DynamoKeyValue {
    fn name(&self) -> &str {
        &self.table_name
    }

    async fn try_get(&self, key: &str) -> StateResult<Option<Value>> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key(KEY_ATTR, AttributeValue::S(key.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(remote_err)?;

        Ok(output.item.map(item_to_document))
    }

    async fn try_set(&self, key: &str, value: &Value) -> StateResult<()> {
        let mut item = document_to_item(value)?;
        item.insert(KEY_ATTR.to_string(), AttributeValue::S(key.to_string()));

        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(item))
            .send()
            .await
            .map_err(remote_err)?;
        debug!(table = %self.table_name, %key, "document stored");
        Ok(())
    }

    async fn try_delete(&self, key: &str) -> StateResult<bool> {
        let output = self
            .client
            .delete_item()
            .table_name(&self.table_name)
            .key(KEY_ATTR, AttributeValue::S(key.to_string()))
            .return_values(aws_sdk_dynamodb::types::ReturnValue::AllOld)
            .send()
            .await
            .map_err(remote_err)?;
        Ok(output.attributes.is_some())
    }

    async fn try_scan(&self) -> StateResult<BTreeMap<String, Value>> {
        let mut results = BTreeMap::new();
        let mut start_key: Option<HashMap<String, AttributeValue>> = None;

        loop {
            let output = self
                .client
                .scan()
                .table_name(&self.table_name)
                .set_exclusive_start_key(start_key.take())
                .send()
                .await
                .map_err(remote_err)?;

            for item in output.items.unwrap_or_default() {
                let Some(key) = item.get(KEY_ATTR).and_then(|v| v.as_s().ok()).cloned() else {
                    warn!(table = %self.table_name, "skipping item without key attribute");
                    continue;
                };
                results.insert(key, item_to_document(item));
            }

            match output.last_evaluated_key {
                Some(next) if !next.is_empty() => start_key = Some(next),
                _ => break,
            }
        }

        Ok(results)
    }
}

// ── Attribute conversion ───────────────────────────────────────

/// Convert a JSON object into item attributes.
///
/// A top-level field named like the hash key would be overwritten by the
/// key on write, so such documents are rejected.
pub fn document_to_item(value: &Value) -> StateResult<HashMap<String, AttributeValue>> {
    let Value::Object(fields) = value else {
        return Err(StateError::Serialize(
            "only JSON objects can be stored as items".to_string(),
        ));
    };
    if fields.contains_key(KEY_ATTR) {
        return Err(StateError::Serialize(format!(
            "top-level field `{KEY_ATTR}` is reserved for the item key"
        )));
    }
    Ok(fields
        .iter()
        .map(|(name, field)| (name.clone(), to_attribute(field)))
        .collect())
}

/// Convert item attributes back into a JSON object, dropping the key.
pub fn item_to_document(mut item: HashMap<String, AttributeValue>) -> Value {
    item.remove(KEY_ATTR);
    let fields: Map<String, Value> = item
        .into_iter()
        .map(|(name, attr)| (name, from_attribute(attr)))
        .collect();
    Value::Object(fields)
}

fn to_attribute(value: &Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(b) => AttributeValue::Bool(*b),
        Value::Number(n) => AttributeValue::N(n.to_string()),
        Value::String(s) => AttributeValue::S(s.clone()),
        Value::Array(items) => AttributeValue::L(items.iter().map(to_attribute).collect()),
        Value::Object(fields) => AttributeValue::M(
            fields
                .iter()
                .map(|(name, field)| (name.clone(), to_attribute(field)))
                .collect(),
        ),
    }
}

fn from_attribute(attr: AttributeValue) -> Value {
    match attr {
        AttributeValue::Null(_) => Value::Null,
        AttributeValue::Bool(b) => Value::Bool(b),
        AttributeValue::N(n) => parse_number(&n),
        AttributeValue::S(s) => Value::String(s),
        AttributeValue::L(items) => Value::Array(items.into_iter().map(from_attribute).collect()),
        AttributeValue::M(fields) => Value::Object(
            fields
                .into_iter()
                .map(|(name, field)| (name, from_attribute(field)))
                .collect(),
        ),
        AttributeValue::Ss(items) => Value::Array(items.into_iter().map(Value::String).collect()),
        AttributeValue::Ns(items) => Value::Array(items.iter().map(|n| parse_number(n)).collect()),
        other => {
            warn!(attribute = ?other, "unsupported attribute type");
            Value::Null
        }
    }
}

fn parse_number(n: &str) -> Value {
    if let Ok(i) = n.parse::<i64>() {
        return Value::Number(i.into());
    }
    if let Ok(u) = n.parse::<u64>() {
        return Value::Number(u.into());
    }
    n.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}
