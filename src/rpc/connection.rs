//! Transport connections behind the resilient client.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tonic::{Code, Status};
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::HealthCheckRequest;
use tracing::debug;

use super::{ConnectivityState, Result, RpcError};
use crate::config::{RpcClientConfig, TlsConfig};

/// An established connection a client can issue calls on.
///
/// Clones share the underlying transport.
#[async_trait]
pub trait Connection: Clone + Send + Sync + 'static {
    /// Current connectivity of the transport.
    fn state(&self) -> ConnectivityState;

    /// Ask the service whether it is serving.
    async fn probe(&self, service: &str, timeout: Duration) -> Result<()>;

    /// Release the transport.
    async fn close(&self) -> Result<()>;
}

/// Dials connections for one service.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection;

    async fn connect(&self, service: &str, config: &RpcClientConfig) -> Result<Self::Connection>;
}

// ============================================================================
// gRPC
// ============================================================================

/// Dials tonic channels.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrpcConnector;

impl GrpcConnector {
    async fn endpoint(config: &RpcClientConfig) -> Result<Endpoint> {
        let endpoint = Endpoint::from_shared(config.endpoint_uri())
            .map_err(|e| RpcError::InvalidEndpoint {
                address: config.address.clone(),
                message: e.to_string(),
            })?
            .timeout(config.timeout())
            .connect_timeout(config.connect_timeout())
            .tcp_keepalive(Some(config.keep_alive()))
            .http2_keep_alive_interval(config.keep_alive())
            .keep_alive_timeout(config.connect_timeout())
            .keep_alive_while_idle(true);

        if !config.enable_tls {
            return Ok(endpoint);
        }

        endpoint
            .tls_config(client_tls(&config.tls).await?)
            .map_err(|e| RpcError::Tls(e.to_string()))
    }
}

/// Build client TLS settings. Falls back to native roots without a CA file.
async fn client_tls(tls: &TlsConfig) -> Result<ClientTlsConfig> {
    let read = |path: std::path::PathBuf| async move {
        tokio::fs::read(&path)
            .await
            .map_err(|e| RpcError::Tls(format!("failed to read {}: {}", path.display(), e)))
    };

    let mut config = ClientTlsConfig::new();
    config = match &tls.ca_file {
        Some(path) => config.ca_certificate(Certificate::from_pem(read(path.clone()).await?)),
        None => config.with_native_roots(),
    };

    match (&tls.cert_file, &tls.key_file) {
        (Some(cert), Some(key)) => {
            let cert = read(cert.clone()).await?;
            let key = read(key.clone()).await?;
            config = config.identity(Identity::from_pem(cert, key));
        }
        (None, None) => {}
        _ => {
            return Err(RpcError::Tls(
                "client certificate and key must be configured together".to_string(),
            ))
        }
    }

    if let Some(domain) = &tls.domain_name {
        config = config.domain_name(domain.clone());
    }
    Ok(config)
}

#[async_trait]
impl Connector for GrpcConnector {
    type Connection = GrpcConnection;

    async fn connect(&self, service: &str, config: &RpcClientConfig) -> Result<GrpcConnection> {
        let endpoint = Self::endpoint(config).await?;
        let connect_error = |message: String| RpcError::Connection {
            service: service.to_string(),
            address: config.address.clone(),
            message,
        };

        let channel = tokio::time::timeout(config.connect_timeout(), endpoint.connect())
            .await
            .map_err(|_| connect_error(format!("timed out after {:?}", config.connect_timeout())))?
            .map_err(|e| connect_error(e.to_string()))?;

        Ok(GrpcConnection::new(channel))
    }
}

/// A tonic channel plus the connectivity last observed on it.
///
/// tonic does not expose channel state, so the state is derived from call
/// outcomes: `UNAVAILABLE` moves it to `TransientFailure`, any answer from
/// the server moves it back to `Ready`.
#[derive(Clone, Debug)]
pub struct GrpcConnection {
    channel: Channel,
    state: Arc<AtomicU8>,
}

impl GrpcConnection {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            state: Arc::new(AtomicU8::new(ConnectivityState::Ready as u8)),
        }
    }

    /// Channel for generated stubs.
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    pub fn set_state(&self, state: ConnectivityState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Update connectivity from a call outcome.
    pub fn observe<T>(&self, result: &std::result::Result<T, Status>) {
        match result {
            Err(status) if status.code() == Code::Unavailable => {
                debug!(message = %status.message(), "Transport unavailable");
                self.set_state(ConnectivityState::TransientFailure);
            }
            _ => self.set_state(ConnectivityState::Ready),
        }
    }
}

#[async_trait]
impl Connection for GrpcConnection {
    fn state(&self) -> ConnectivityState {
        ConnectivityState::from_u8(self.state.load(Ordering::SeqCst))
    }

    async fn probe(&self, service: &str, timeout: Duration) -> Result<()> {
        let mut client = HealthClient::new(self.channel());
        let request = HealthCheckRequest {
            service: service.to_string(),
        };

        let response = tokio::time::timeout(timeout, client.check(request))
            .await
            .map_err(|_| RpcError::Timeout {
                operation: format!("{} health check", service),
                after: timeout,
            })?;
        self.observe(&response);

        let health_error = |message: String| RpcError::Health {
            service: service.to_string(),
            message,
        };
        let status = response
            .map_err(|s| health_error(s.message().to_string()))?
            .into_inner()
            .status();

        match status {
            ServingStatus::Serving => Ok(()),
            other => Err(health_error(format!("status {}", other.as_str_name()))),
        }
    }

    async fn close(&self) -> Result<()> {
        self.set_state(ConnectivityState::Shutdown);
        Ok(())
    }
}
