//! gRPC client configuration types.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Default chat service address.
pub const DEFAULT_CHAT_ADDRESS: &str = "localhost:50051";
/// Default stream service address.
pub const DEFAULT_STREAM_ADDRESS: &str = "localhost:50052";

/// Configuration of one downstream gRPC client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RpcClientConfig {
    /// Service address (host:port).
    pub address: String,
    /// Per-request timeout.
    pub timeout_ms: u64,
    /// Retries performed by `with_retry` after the first attempt.
    pub max_retries: u32,
    /// Base unit of the linear backoff between retries.
    pub retry_delay_ms: u64,
    /// HTTP/2 keep-alive ping interval.
    pub keep_alive_ms: u64,
    /// Timeout for establishing the connection.
    pub connect_timeout_ms: u64,
    /// Use TLS instead of plaintext.
    pub enable_tls: bool,
    /// TLS material, used when `enable_tls` is set.
    pub tls: TlsConfig,
    /// Timeout of the health probe.
    pub health_check_timeout_ms: u64,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_CHAT_ADDRESS.to_string(),
            timeout_ms: 30_000,
            max_retries: 3,
            retry_delay_ms: 1_000,
            keep_alive_ms: 30_000,
            connect_timeout_ms: 10_000,
            enable_tls: false,
            tls: TlsConfig::default(),
            health_check_timeout_ms: 5_000,
        }
    }
}

impl RpcClientConfig {
    /// Defaults for the chat service client.
    pub fn chat_defaults() -> Self {
        Self::default()
    }

    /// Defaults for the stream service client.
    pub fn stream_defaults() -> Self {
        Self {
            address: DEFAULT_STREAM_ADDRESS.to_string(),
            ..Self::default()
        }
    }

    /// Same defaults, different address.
    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    /// Endpoint URI for the configured address and transport security.
    pub fn endpoint_uri(&self) -> String {
        if self.address.contains("://") {
            return self.address.clone();
        }
        let scheme = if self.enable_tls { "https" } else { "http" };
        format!("{}://{}", scheme, self.address)
    }
}

/// TLS material for a gRPC client.
///
/// Without a CA file the platform's native roots are trusted.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM file with the CA certificate(s) to trust.
    pub ca_file: Option<PathBuf>,
    /// PEM client certificate for mutual TLS.
    pub cert_file: Option<PathBuf>,
    /// PEM client key for mutual TLS.
    pub key_file: Option<PathBuf>,
    /// Server name to verify, when it differs from the address host.
    pub domain_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_client_config_default() {
        let config = RpcClientConfig::default();
        assert_eq!(config.address, DEFAULT_CHAT_ADDRESS);
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay(), Duration::from_secs(1));
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert!(!config.enable_tls);
    }

    #[test]
    fn test_stream_defaults_address() {
        let config = RpcClientConfig::stream_defaults();
        assert_eq!(config.address, DEFAULT_STREAM_ADDRESS);
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_endpoint_uri_scheme() {
        let mut config = RpcClientConfig::with_address("chat:9001");
        assert_eq!(config.endpoint_uri(), "http://chat:9001");

        config.enable_tls = true;
        assert_eq!(config.endpoint_uri(), "https://chat:9001");

        config.address = "http://already:1".to_string();
        assert_eq!(config.endpoint_uri(), "http://already:1");
    }
}
