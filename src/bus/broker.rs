//! Broker abstraction the event bus runs on.
//!
//! The bus owns routing, stamping, (de)serialization and the ack policy; a
//! broker only moves bytes between subjects and persistent streams.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::sync::mpsc;

use super::Result;
use crate::config::EventBusConfig;
use crate::events::EventCategory;

/// Outcome of provisioning a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamProvisioning {
    Created,
    Existing,
}

/// Persistent stream capturing one category's subjects.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDefinition {
    pub name: String,
    pub subjects: Vec<String>,
    /// File storage when true, memory storage otherwise.
    pub durable_storage: bool,
    pub max_age: Duration,
}

impl StreamDefinition {
    pub fn for_category(category: EventCategory, config: &EventBusConfig) -> Self {
        Self {
            name: category.stream_name().to_string(),
            subjects: vec![category.subject_wildcard()],
            durable_storage: config.durable,
            max_age: config.max_age(category),
        }
    }
}

/// Consumer reading a category's stream with explicit acks.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerSpec {
    pub stream: String,
    /// Named consumers keep their position across restarts.
    pub durable_name: Option<String>,
    pub filter_subject: String,
    pub ack_wait: Duration,
    /// -1 = unlimited.
    pub max_deliver: i64,
}

impl ConsumerSpec {
    pub fn for_category(category: EventCategory, config: &EventBusConfig) -> Self {
        Self {
            stream: category.stream_name().to_string(),
            durable_name: config.durable.then(|| category.consumer_name()),
            filter_subject: category.subject_wildcard(),
            ack_wait: config.ack_wait(),
            max_deliver: config.max_deliver,
        }
    }
}

/// Connection lifecycle notification emitted by a broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    Closed,
    /// Anything else worth logging (slow consumer, server errors).
    Notice(String),
}

/// Transport-level counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub messages_published: u64,
    pub messages_received: u64,
}

/// A received message awaiting acknowledgement.
///
/// Dropping a delivery without acking leaves it to the broker's redelivery.
#[async_trait]
pub trait Delivery: Send {
    fn subject(&self) -> &str;
    fn payload(&self) -> &[u8];
    async fn ack(&mut self) -> Result<()>;
}

/// Ordered deliveries of one consumer.
pub type DeliveryStream = BoxStream<'static, Result<Box<dyn Delivery>>>;

/// Live broker connection.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Create the stream unless it already exists.
    async fn ensure_stream(&self, definition: &StreamDefinition) -> Result<StreamProvisioning>;

    /// Publish and wait for the broker to persist the message.
    async fn publish(&self, subject: String, payload: Bytes) -> Result<()>;

    /// Bind a consumer and stream its deliveries.
    async fn consume(&self, spec: &ConsumerSpec) -> Result<DeliveryStream>;

    fn statistics(&self) -> TransportStats;

    /// Flush pending publishes and close the connection.
    async fn close(&self) -> Result<()>;
}

/// Dials a broker.
///
/// Lifecycle changes after the dial are reported on `events`.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        config: &EventBusConfig,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn Broker>>;
}
