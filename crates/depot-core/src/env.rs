//! Translation of a [`GatewayConfig`] into process environment variables.
//!
//! Workers and importers are configured exclusively through their
//! environment, so every backend renders the same map through
//! [`to_environment`].

use std::collections::BTreeMap;

use crate::config::KeyValueKind;
use crate::types::GatewayConfig;

/// Which process the environment is rendered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvMode {
    /// Long-running worker serving a mapped version.
    Worker,
    /// One-shot importer that reports progress to the key-value store.
    Importer,
    /// Importer started by hand on a developer machine.
    ImporterLocal,
}

pub fn to_environment(config: &GatewayConfig, mode: EnvMode) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    let mut set = |key: &str, value: String| {
        env.insert(key.to_string(), value);
    };

    set("PREFIX", config.prefix.clone());
    set("VERSION", config.version.clone());
    set("DB_DATABASE", config.db.database.clone());
    set("DB_USER", config.db.user.clone());
    set("DB_PASSWORD", config.db.password.clone());
    set("DB_SERVER", config.db.server.clone());
    set("DB_TRANSACTION_LIMIT", config.db.transaction_limit.to_string());
    set("DB_CONNECTION_TIMEOUT", config.db.connection_timeout.to_string());
    set("DB_REQUEST_TIMEOUT", config.db.request_timeout.to_string());
    set("STORAGE_SERVICE", config.storage_service.to_string());
    set("SHAPES_CONTAINER", config.shapes_container.clone());
    set("SHAPES_REGION", config.shapes_region.clone());
    set("SHAPES_SKIP", (mode == EnvMode::ImporterLocal).to_string());

    match mode {
        EnvMode::Worker => {
            for (name, key) in &config.api {
                set(&api_key_var(name), key.clone());
            }
            if let Some(redis) = &config.redis {
                set("REDIS_HOST", redis.host.clone());
                set("REDIS_PORT", redis.port.to_string());
            }
            set("NEW_REALTIME", config.new_realtime.to_string());
        }
        EnvMode::Importer | EnvMode::ImporterLocal => {
            let keyvalue = match mode {
                EnvMode::ImporterLocal => KeyValueKind::Local,
                _ => config.keyvalue,
            };
            set("KEYVALUE", keyvalue.to_string());
            set(
                "KEYVALUE_VERSION_TABLE",
                format!("{}-versions", config.keyvalue_prefix),
            );
            set("KEYVALUE_REGION", config.keyvalue_region.clone());
        }
    }

    env
}

/// `agenda-21` becomes `AGENDA_21_API_KEY`.
fn api_key_var(name: &str) -> String {
    let upper: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("{upper}_API_KEY")
}

/// Render a `docker run` command that imports `config` against a local
/// database container.
pub fn docker_command(config: &GatewayConfig, image: &str, db_container: &str) -> String {
    let env = to_environment(config, EnvMode::ImporterLocal);
    let flags: Vec<String> = env
        .iter()
        .map(|(key, value)| format!("-e \"{key}={}\"", quote_escape(value)))
        .collect();
    format!(
        "docker run {} --network=\"container:{db_container}\" {image}",
        flags.join(" ")
    )
}

/// Escape the characters the shell still interprets inside double quotes.
fn quote_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
