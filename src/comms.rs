//! One handle over the event bus and both service clients.

use std::sync::Arc;

use tracing::{info, warn};

use crate::bus::{self, BrokerConnector, BusError, EventBus};
use crate::config::Config;
use crate::rpc::{ChatClient, StreamClient};
use crate::status::{CommsStatus, ComponentHealth, HealthReport};

/// The communication layer as a host process sees it.
pub struct Comms {
    pub bus: EventBus,
    pub chat: ChatClient,
    pub stream: StreamClient,
}

impl Comms {
    pub fn new(config: &Config, connector: Arc<dyn BrokerConnector>) -> Self {
        Self {
            bus: EventBus::new(config.event_bus.clone(), connector),
            chat: ChatClient::new(config.chat.clone()),
            stream: StreamClient::new(config.stream.clone()),
        }
    }

    /// Layer backed by NATS JetStream.
    #[cfg(feature = "nats")]
    pub fn from_config(config: &Config) -> Self {
        Self::new(config, Arc::new(bus::NatsConnector))
    }

    /// Connect the bus and warm up the clients.
    ///
    /// Only a bus failure is fatal: clients that cannot connect yet are
    /// logged and dial again on their first call.
    pub async fn start(&self) -> bus::Result<()> {
        self.bus.connect(None).await?;

        if let Err(e) = self.chat.connect().await {
            warn!(error = %e, "Chat service unavailable, will connect on first call");
        }
        if let Err(e) = self.stream.connect().await {
            warn!(error = %e, "Stream service unavailable, will connect on first call");
        }

        info!("Communication layer started");
        Ok(())
    }

    pub async fn status(&self) -> CommsStatus {
        CommsStatus {
            event_bus: self.bus.status().await,
            chat: self.chat.status().await,
            stream: self.stream.status().await,
        }
    }

    /// Probe every component.
    pub async fn health(&self) -> HealthReport {
        let event_bus = ComponentHealth::from_result(if self.bus.is_connected() {
            Ok(())
        } else {
            Err(BusError::NotConnected)
        });
        let chat = ComponentHealth::from_result(self.chat.health().await);
        let stream = ComponentHealth::from_result(self.stream.health().await);

        HealthReport {
            healthy: event_bus.healthy && chat.healthy && stream.healthy,
            event_bus,
            chat,
            stream,
        }
    }

    /// Close everything. Errors are logged; shutdown always completes.
    pub async fn shutdown(&self) {
        if let Err(e) = self.bus.close().await {
            warn!(error = %e, "Error closing event bus");
        }
        if let Err(e) = self.chat.close().await {
            warn!(error = %e, "Error closing chat client");
        }
        if let Err(e) = self.stream.close().await {
            warn!(error = %e, "Error closing stream client");
        }
        info!("Communication layer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryConnector;
    use crate::config::RpcClientConfig;

    fn unreachable_config() -> Config {
        // Port 1 on loopback refuses connections immediately
        Config {
            chat: RpcClientConfig {
                connect_timeout_ms: 500,
                ..RpcClientConfig::with_address("127.0.0.1:1")
            },
            stream: RpcClientConfig {
                connect_timeout_ms: 500,
                ..RpcClientConfig::with_address("127.0.0.1:1")
            },
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_start_survives_unreachable_services() {
        let comms = Comms::new(&unreachable_config(), Arc::new(MemoryConnector::new()));

        comms.start().await.unwrap();

        let status = comms.status().await;
        assert!(status.event_bus.connected);
        assert!(!status.chat.connected);
        assert!(status.chat.last_error.is_some());
        assert_eq!(status.stream.service_name, "stream");

        let health = comms.health().await;
        assert!(!health.healthy);
        assert!(health.event_bus.healthy);
        assert!(!health.chat.healthy);

        comms.shutdown().await;
        assert!(!comms.bus.is_connected());
    }
}
