//! depot-state: key-value tables for the Depot orchestrator.
//!
//! Three logical tables hold all orchestrator state:
//!
//! | Table | Key | Value |
//! |---|---|---|
//! | `versions` | version id | `Version` record |
//! | `mappings` | region prefix | `{ "value": version_id }` |
//! | `meta` | `"config"` | remote config override |
//!
//! Each table is a [`KeyValueStore`]: JSON documents under string keys,
//! atomic per key, no cross-key transactions. [`LocalDatabase`] keeps the
//! tables in one redb file; [`DynamoKeyValue`] maps each table onto a
//! DynamoDB table.

pub mod dynamo;
pub mod error;
pub mod kv;
pub mod local;
pub mod tables;

pub use dynamo::DynamoKeyValue;
pub use error::{StateError, StateResult};
pub use kv::{KeyValueStore, empty_document, is_empty_document};
pub use local::{LocalDatabase, LocalKeyValue};
pub use tables::Tables;
