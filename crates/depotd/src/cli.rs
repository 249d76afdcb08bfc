//! Command line and environment overrides.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use depot_core::{KeyValueKind, OrchestratorConfig, StorageService};
use serde::de::DeserializeOwned;
use tracing::info;

#[derive(Parser)]
#[command(name = "depotd", about = "Transit dataset deployment orchestrator")]
pub struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the orchestrator and its control API.
    Serve(ConfigArgs),
    /// Print the effective configuration, including the stored override.
    Config(ConfigArgs),
}

#[derive(Args, Default)]
pub struct ConfigArgs {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(long, short, env = "DEPOT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Control API port.
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Key-value backend: `local` or `dynamo`.
    #[arg(long, env = "KEYVALUE", value_parser = lowercase::<KeyValueKind>)]
    pub keyvalue: Option<KeyValueKind>,

    /// Prefix of the key-value table names.
    #[arg(long, env = "KEYVALUE_PREFIX")]
    pub keyvalue_prefix: Option<String>,

    #[arg(long, env = "KEYVALUE_REGION")]
    pub keyvalue_region: Option<String>,

    /// Static asset storage: `aws` or `local`.
    #[arg(long, env = "STORAGE_SERVICE", value_parser = lowercase::<StorageService>)]
    pub storage_service: Option<StorageService>,
}

impl ConfigArgs {
    /// Read the config file and apply command line overrides.
    pub fn load(&self) -> anyhow::Result<OrchestratorConfig> {
        let mut config = match &self.config {
            Some(path) => {
                info!(path = ?path, "loading config");
                OrchestratorConfig::from_file(path)
                    .with_context(|| format!("loading {}", path.display()))?
            }
            None => OrchestratorConfig::default(),
        };

        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(keyvalue) = self.keyvalue {
            config.keyvalue = keyvalue;
        }
        if let Some(prefix) = &self.keyvalue_prefix {
            config.keyvalue_prefix = prefix.clone();
        }
        if let Some(region) = &self.keyvalue_region {
            config.keyvalue_region = region.clone();
        }
        if let Some(storage) = self.storage_service {
            config.storage_service = storage;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Parse a lower-case enum through its serde names.
fn lowercase<T: DeserializeOwned>(value: &str) -> Result<T, String> {
    serde_json::from_value(serde_json::Value::String(value.to_ascii_lowercase()))
        .map_err(|_| format!("unsupported value {value:?}"))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn overrides_apply_over_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port = 8000\nkeyvalue_prefix = \"file\"").unwrap();

        let args = ConfigArgs {
            config: Some(file.path().to_path_buf()),
            port: Some(9100),
            keyvalue: Some(KeyValueKind::Dynamo),
            ..ConfigArgs::default()
        };
        let config = args.load().unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.keyvalue, KeyValueKind::Dynamo);
        assert_eq!(config.keyvalue_prefix, "file");
    }

    #[test]
    fn empty_prefix_override_is_rejected() {
        let args = ConfigArgs {
            keyvalue_prefix: Some(String::new()),
            ..ConfigArgs::default()
        };
        assert!(args.load().is_err());
    }

    #[test]
    fn enum_values_parse_case_insensitively() {
        assert_eq!(lowercase::<KeyValueKind>("Dynamo").unwrap(), KeyValueKind::Dynamo);
        assert_eq!(lowercase::<StorageService>("local").unwrap(), StorageService::Local);
        assert!(lowercase::<KeyValueKind>("etcd").is_err());
    }

    #[test]
    fn cli_parses_serve() {
        let cli = Cli::try_parse_from(["depotd", "serve", "--port", "9001", "--keyvalue", "local"])
            .unwrap();
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.port, Some(9001));
        assert_eq!(args.keyvalue, Some(KeyValueKind::Local));
    }
}
