//! Event bus configuration types.

use std::time::Duration;

use serde::Deserialize;

use crate::events::EventCategory;

/// Default broker URL, used when neither the caller nor the config names one.
pub const DEFAULT_NATS_URL: &str = "nats://localhost:4222";

/// Default client identifier. Also stamped as the `source` of every event.
pub const DEFAULT_CLIENT_ID: &str = "veza-backend";

/// Event bus configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Broker URL.
    pub url: String,
    /// Connection name and event `source`.
    pub client_id: String,
    /// Timeout for the initial connection handshake.
    pub connect_timeout_ms: u64,
    /// Reconnect attempts after a lost connection. None = unlimited.
    pub max_reconnects: Option<usize>,
    /// Wait between reconnect attempts.
    pub reconnect_wait_ms: u64,
    /// Largest serialized event accepted by publish.
    pub max_payload_bytes: usize,
    /// Publishes awaiting a broker ack at the same time.
    pub max_pub_acks_inflight: usize,
    /// Per-subscription message buffer.
    pub subscription_capacity: usize,
    /// Outgoing command buffer of the connection.
    pub client_capacity: usize,
    /// File-backed streams and durable named consumers when true;
    /// memory streams and ephemeral consumers otherwise.
    pub durable: bool,
    /// How long the broker waits for an ack before redelivering.
    pub ack_wait_ms: u64,
    /// Delivery attempts per message. -1 = unlimited.
    pub max_deliver: i64,
    /// Retention of chat events.
    pub chat_retention_hours: u64,
    /// Retention of stream events.
    pub stream_retention_hours: u64,
    /// Retention of user events.
    pub user_retention_hours: u64,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_NATS_URL.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            connect_timeout_ms: 10_000,
            max_reconnects: None,
            reconnect_wait_ms: 2_000,
            max_payload_bytes: 1024 * 1024,
            max_pub_acks_inflight: 1000,
            subscription_capacity: 1024,
            client_capacity: 2048,
            durable: true,
            ack_wait_ms: 30_000,
            max_deliver: -1,
            chat_retention_hours: 24,
            stream_retention_hours: 24,
            user_retention_hours: 7 * 24,
        }
    }
}

impl EventBusConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_wait(&self) -> Duration {
        Duration::from_millis(self.reconnect_wait_ms)
    }

    pub fn ack_wait(&self) -> Duration {
        Duration::from_millis(self.ack_wait_ms)
    }

    /// Retention for a category's stream.
    pub fn max_age(&self, category: EventCategory) -> Duration {
        let hours = match category {
            EventCategory::Chat => self.chat_retention_hours,
            EventCategory::Stream => self.stream_retention_hours,
            EventCategory::User => self.user_retention_hours,
        };
        Duration::from_secs(hours * 60 * 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_bus_config_default() {
        let config = EventBusConfig::default();
        assert_eq!(config.url, DEFAULT_NATS_URL);
        assert_eq!(config.client_id, "veza-backend");
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.reconnect_wait(), Duration::from_secs(2));
        assert!(config.max_reconnects.is_none());
        assert!(config.durable);
    }

    #[test]
    fn test_default_retention_matches_categories() {
        let config = EventBusConfig::default();
        for category in EventCategory::ALL {
            assert_eq!(config.max_age(category), category.default_max_age());
        }
    }
}
