//! Connection lifecycle shared by every service client.

use std::future::Future;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::{Response, Status};
use tracing::{debug, error, info, warn};

use super::connection::{Connection, Connector, GrpcConnector};
use super::{Result, RpcError};
use crate::config::RpcClientConfig;
use crate::status::ClientStatus;
use crate::utils::retry::{client_backoff, retry_with_backoff, RetryError};

struct ClientState<T> {
    connection: Option<T>,
    connected: bool,
    last_error: Option<String>,
}

impl<T: Connection> ClientState<T> {
    /// The connection, if the flag is set and the transport agrees.
    fn live(&self) -> Option<&T> {
        self.connection
            .as_ref()
            .filter(|c| self.connected && c.state().is_connected())
    }
}

/// Lazily connected client for one downstream service.
///
/// `connect`, `close` and `reconnect` hold the write lock; status reads
/// share the read lock. Calls run on a cloned connection with no lock held.
pub struct ResilientClient<C: Connector> {
    service_name: String,
    health_service: String,
    config: RpcClientConfig,
    connector: C,
    state: RwLock<ClientState<C::Connection>>,
}

impl<C: Connector> ResilientClient<C> {
    /// Create a disconnected client.
    ///
    /// `health_service` is the name sent in health probes.
    pub fn new(
        service_name: impl Into<String>,
        health_service: impl Into<String>,
        config: RpcClientConfig,
        connector: C,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            health_service: health_service.into(),
            config,
            connector,
            state: RwLock::new(ClientState {
                connection: None,
                connected: false,
                last_error: None,
            }),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn config(&self) -> &RpcClientConfig {
        &self.config
    }

    /// Dial unless already connected.
    ///
    /// A cached connection whose transport left `Ready`/`Idle` is replaced.
    pub async fn connect(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.live().is_some() {
            return Ok(());
        }
        if let Some(stale) = state.connection.take() {
            debug!(service = %self.service_name, state = %stale.state(), "Replacing stale connection");
            if let Err(e) = stale.close().await {
                debug!(service = %self.service_name, error = %e, "Ignoring close error on stale connection");
            }
        }
        self.dial(&mut state).await
    }

    async fn dial(&self, state: &mut ClientState<C::Connection>) -> Result<()> {
        info!(service = %self.service_name, address = %self.config.address, "Connecting");
        state.connected = false;

        match self.connector.connect(&self.service_name, &self.config).await {
            Ok(connection) => {
                state.connection = Some(connection);
                state.connected = true;
                state.last_error = None;
                info!(service = %self.service_name, address = %self.config.address, "Connected");
                Ok(())
            }
            Err(e) => {
                error!(
                    service = %self.service_name,
                    address = %self.config.address,
                    error = %e,
                    "Failed to connect"
                );
                state.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Release the connection. Safe to call repeatedly.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.connected = false;
        let Some(connection) = state.connection.take() else {
            return Ok(());
        };
        info!(service = %self.service_name, "Closing connection");
        connection.close().await
    }

    /// True only when connected and the transport is `Ready` or `Idle`.
    pub async fn is_connected(&self) -> bool {
        self.state.read().await.live().is_some()
    }

    /// Return a live connection, dialing first if needed.
    pub async fn ensure_connected(&self) -> Result<C::Connection> {
        if let Some(connection) = self.state.read().await.live() {
            return Ok(connection.clone());
        }

        self.connect().await?;

        self.state
            .read()
            .await
            .live()
            .cloned()
            .ok_or_else(|| RpcError::NotConnected {
                service: self.service_name.clone(),
            })
    }

    /// Probe the service. Fails fast when not connected.
    pub async fn health(&self) -> Result<()> {
        let connection = match self.state.read().await.live() {
            Some(connection) => connection.clone(),
            None => {
                return Err(RpcError::NotConnected {
                    service: self.service_name.clone(),
                })
            }
        };

        let result = connection
            .probe(&self.health_service, self.config.health_check_timeout())
            .await;
        if let Err(e) = &result {
            warn!(service = %self.service_name, error = %e, "Health check failed");
            self.record_error(e).await;
        }
        result
    }

    /// Close the current connection, ignoring close errors, and dial again.
    pub async fn reconnect(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(connection) = state.connection.take() {
            if let Err(e) = connection.close().await {
                debug!(service = %self.service_name, error = %e, "Ignoring close error on reconnect");
            }
        }
        info!(service = %self.service_name, "Reconnecting");
        self.dial(&mut state).await
    }

    /// Run `f` up to `max_retries + 1` times with linear backoff.
    ///
    /// Waits between attempts end early when `cancel` fires, returning
    /// [`RpcError::Cancelled`].
    pub async fn with_retry<T, F, Fut>(&self, cancel: &CancellationToken, f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        retry_with_backoff(&self.service_name, client_backoff(&self.config), cancel, f)
            .await
            .map_err(|e| match e {
                RetryError::Exhausted { attempts, last } => RpcError::RetriesExhausted {
                    attempts,
                    source: Box::new(last),
                },
                RetryError::Cancelled { .. } => RpcError::Cancelled,
            })
    }

    /// Remember a call failure for status reporting.
    pub async fn record_error(&self, error: &RpcError) {
        self.state.write().await.last_error = Some(error.to_string());
    }

    /// Snapshot for health endpoints.
    pub async fn status(&self) -> ClientStatus {
        let state = self.state.read().await;
        ClientStatus {
            service_name: self.service_name.clone(),
            address: self.config.address.clone(),
            connected: state.live().is_some(),
            connection_state: state
                .connection
                .as_ref()
                .map(|c| c.state().to_string())
                .unwrap_or_default(),
            last_error: state.last_error.clone(),
        }
    }
}

impl ResilientClient<GrpcConnector> {
    /// Lazy-connect, then run one unary call on the channel.
    ///
    /// The call outcome feeds the connection's state; failures are recorded.
    pub async fn call<T, F, Fut>(&self, operation: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(Channel) -> Fut,
        Fut: Future<Output = std::result::Result<Response<T>, Status>>,
    {
        let connection = self.ensure_connected().await?;
        let result = f(connection.channel()).await;
        connection.observe(&result);

        match result {
            Ok(response) => Ok(response.into_inner()),
            Err(status) => {
                warn!(
                    service = %self.service_name,
                    operation,
                    code = ?status.code(),
                    message = %status.message(),
                    "Call failed"
                );
                let err = RpcError::Grpc(status);
                self.record_error(&err).await;
                Err(err)
            }
        }
    }

    /// Turn a non-empty `error` field of a response into [`RpcError::Rejected`].
    pub async fn check_rejected(&self, error: &str) -> Result<()> {
        if error.is_empty() {
            return Ok(());
        }
        let err = RpcError::Rejected {
            service: self.service_name.clone(),
            message: error.to_string(),
        };
        self.record_error(&err).await;
        Err(err)
    }
}
