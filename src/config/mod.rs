//! Communication layer configuration.
//!
//! Aggregates event bus and gRPC client configuration into a single Config
//! struct that can be loaded from YAML files or environment variables.

mod client;
mod messaging;

pub use client::{RpcClientConfig, TlsConfig, DEFAULT_CHAT_ADDRESS, DEFAULT_STREAM_ADDRESS};
pub use messaging::{EventBusConfig, DEFAULT_CLIENT_ID, DEFAULT_NATS_URL};

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "veza-comms.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "VEZA_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "VEZA";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "VEZA_LOG";

/// Main configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Event bus configuration.
    pub event_bus: EventBusConfig,
    /// Chat service client.
    pub chat: RpcClientConfig,
    /// Stream service client.
    pub stream: RpcClientConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            event_bus: EventBusConfig::default(),
            chat: RpcClientConfig::chat_defaults(),
            stream: RpcClientConfig::stream_defaults(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `veza-comms.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix,
    ///    e.g. `VEZA__CHAT__ADDRESS=chat:50051`
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        // Sections share one struct default, so seed the stream address
        let mut builder = ConfigLib::builder()
            .set_default("stream.address", DEFAULT_STREAM_ADDRESS)?
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.chat.address, DEFAULT_CHAT_ADDRESS);
        assert_eq!(config.stream.address, DEFAULT_STREAM_ADDRESS);
        assert_eq!(config.event_bus.url, DEFAULT_NATS_URL);
    }

    #[test]
    #[serial]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "event_bus:\n  url: nats://bus:4222\n  durable: false\nchat:\n  address: chat:9000\n  max_retries: 5\n"
        )
        .unwrap();

        let config = Config::load(file.path().to_str()).unwrap();

        assert_eq!(config.event_bus.url, "nats://bus:4222");
        assert!(!config.event_bus.durable);
        assert_eq!(config.chat.address, "chat:9000");
        assert_eq!(config.chat.max_retries, 5);
        // Unset fields keep their defaults
        assert_eq!(config.chat.retry_delay_ms, 1_000);
        assert_eq!(config.stream.address, DEFAULT_STREAM_ADDRESS);
    }

    #[test]
    #[serial]
    fn test_partial_stream_section_keeps_stream_address() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "stream:\n  max_retries: 1\n").unwrap();

        let config = Config::load(file.path().to_str()).unwrap();

        assert_eq!(config.stream.max_retries, 1);
        assert_eq!(config.stream.address, DEFAULT_STREAM_ADDRESS);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("VEZA__STREAM__ADDRESS", "stream:7000");
        std::env::set_var("VEZA__EVENT_BUS__CLIENT_ID", "api-1");

        let config = Config::load(None);

        std::env::remove_var("VEZA__STREAM__ADDRESS");
        std::env::remove_var("VEZA__EVENT_BUS__CLIENT_ID");

        let config = config.unwrap();
        assert_eq!(config.stream.address, "stream:7000");
        assert_eq!(config.event_bus.client_id, "api-1");
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_is_an_error() {
        assert!(Config::load(Some("/nonexistent/veza-comms.yaml")).is_err());
    }
}
