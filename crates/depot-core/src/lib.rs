//! depot-core: shared types for the Depot dataset orchestrator.
//!
//! Holds the orchestrator configuration model, the persisted [`Version`]
//! and [`Mapping`] records, the derived [`GatewayConfig`] handed to
//! gateways on every actuation, and the pure translation from a
//! `GatewayConfig` into worker/importer environment variables.

pub mod config;
pub mod env;
pub mod error;
pub mod types;

pub use config::*;
pub use env::{EnvMode, docker_command, to_environment};
pub use error::{ConfigError, ConfigResult};
pub use types::*;
