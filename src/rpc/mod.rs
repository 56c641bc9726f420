//! Resilient gRPC clients for the chat and stream services.
//!
//! Clients connect lazily: every domain operation first ensures a live
//! connection, then issues the call without holding the client's lock.
//! Retrying is opt-in through `with_retry`; there is no background
//! reconnection loop.

use std::fmt;
use std::time::Duration;

use tonic::Status;

/// Lifecycle operations shared by the chat and stream clients.
macro_rules! delegate_lifecycle {
    ($client:ty) => {
        impl $client {
            /// Dial the service unless already connected.
            pub async fn connect(&self) -> $crate::rpc::Result<()> {
                self.inner.connect().await
            }

            /// Drop the connection. Safe to call repeatedly.
            pub async fn close(&self) -> $crate::rpc::Result<()> {
                self.inner.close().await
            }

            pub async fn is_connected(&self) -> bool {
                self.inner.is_connected().await
            }

            /// Probe the service's health endpoint.
            pub async fn health(&self) -> $crate::rpc::Result<()> {
                self.inner.health().await
            }

            /// Close and dial again.
            pub async fn reconnect(&self) -> $crate::rpc::Result<()> {
                self.inner.reconnect().await
            }

            /// Retry `f` with the client's linear backoff.
            pub async fn with_retry<T, F, Fut>(
                &self,
                cancel: &tokio_util::sync::CancellationToken,
                f: F,
            ) -> $crate::rpc::Result<T>
            where
                F: FnMut() -> Fut,
                Fut: std::future::Future<Output = $crate::rpc::Result<T>>,
            {
                self.inner.with_retry(cancel, f).await
            }

            pub async fn status(&self) -> $crate::status::ClientStatus {
                self.inner.status().await
            }
        }
    };
}

pub(crate) use delegate_lifecycle;

pub mod chat;
pub mod client;
pub mod connection;
pub mod stream;

pub use chat::ChatClient;
pub use client::ResilientClient;
pub use connection::{Connection, Connector, GrpcConnection, GrpcConnector};
pub use stream::StreamClient;

// ============================================================================
// Errors
// ============================================================================

/// Result type for RPC client operations.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Errors that can occur during RPC client operations.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("Failed to connect to {service} at {address}: {message}")]
    Connection {
        service: String,
        address: String,
        message: String,
    },

    #[error("{service} client is not connected")]
    NotConnected { service: String },

    #[error("Invalid endpoint '{address}': {message}")]
    InvalidEndpoint { address: String, message: String },

    #[error("TLS configuration failed: {0}")]
    Tls(String),

    #[error("gRPC error: {0}")]
    Grpc(#[from] Status),

    #[error("{service} rejected request: {message}")]
    Rejected { service: String, message: String },

    #[error("{service} health check failed: {message}")]
    Health { service: String, message: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Max retries exceeded after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        source: Box<RpcError>,
    },
}

// ============================================================================
// Connectivity
// ============================================================================

/// Transport connectivity state, named after gRPC's channel states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectivityState {
    Idle = 0,
    Connecting = 1,
    Ready = 2,
    TransientFailure = 3,
    Shutdown = 4,
}

impl ConnectivityState {
    /// Only `Ready` and `Idle` count as connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectivityState::Ready | ConnectivityState::Idle)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectivityState::Idle => "IDLE",
            ConnectivityState::Connecting => "CONNECTING",
            ConnectivityState::Ready => "READY",
            ConnectivityState::TransientFailure => "TRANSIENT_FAILURE",
            ConnectivityState::Shutdown => "SHUTDOWN",
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectivityState::Idle,
            1 => ConnectivityState::Connecting,
            2 => ConnectivityState::Ready,
            3 => ConnectivityState::TransientFailure,
            _ => ConnectivityState::Shutdown,
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
