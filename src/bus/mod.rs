//! Durable typed event bus.
//!
//! This module contains:
//! - `EventBus`: connection lifecycle, stream provisioning, typed publish and subscribe
//! - `EventHandler` trait: for processing delivered events
//! - `Broker` traits: the transport the bus runs on
//! - Implementations: NATS JetStream, in-memory

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::StreamExt;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{EventBusConfig, DEFAULT_NATS_URL};
use crate::events::{ChatEvent, DomainEvent, EventCategory, StreamEvent, UserEvent};
use crate::status::EventBusStatus;

pub mod broker;
pub mod memory;
#[cfg(feature = "nats")]
pub mod nats;

pub use broker::{
    Broker, BrokerConnector, ConnectionEvent, ConsumerSpec, Delivery, DeliveryStream,
    StreamDefinition, StreamProvisioning, TransportStats,
};
pub use memory::{MemoryBroker, MemoryConnector};
#[cfg(feature = "nats")]
pub use nats::NatsConnector;

// ============================================================================
// Errors and handlers
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Event bus is not connected")]
    NotConnected,

    #[error("Failed to provision stream '{stream}': {message}")]
    Provisioning { stream: String, message: String },

    #[error("Failed to serialize {category} event: {source}")]
    Serialization {
        category: EventCategory,
        #[source]
        source: serde_json::Error,
    },

    #[error("Event payload of {size} bytes exceeds limit of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Publish to '{subject}' failed: {message}")]
    Publish { subject: String, message: String },

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Ack failed: {0}")]
    Ack(String),
}

/// Error returned by an event handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Handler for events of one category.
///
/// `Ok` acknowledges the message; `Err` leaves it for redelivery.
pub trait EventHandler<E>: Send + Sync + 'static {
    fn handle(&self, event: E) -> BoxFuture<'static, std::result::Result<(), HandlerError>>;
}

impl<E, F, Fut> EventHandler<E> for F
where
    F: Fn(E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    fn handle(&self, event: E) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        Box::pin(self(event))
    }
}

// ============================================================================
// EventBus
// ============================================================================

/// Connectivity as seen by the status updater.
#[derive(Default)]
struct Link {
    connected: AtomicBool,
    last_connected: Mutex<Option<DateTime<Utc>>>,
}

impl Link {
    fn mark_connected(&self) {
        *self.last_connected() = Some(Utc::now());
        self.connected.store(true, Ordering::SeqCst);
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn last_connected(&self) -> MutexGuard<'_, Option<DateTime<Utc>>> {
        self.last_connected
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Background tasks owned by a connection.
#[derive(Default)]
struct Lifecycle {
    status_task: Option<JoinHandle<()>>,
    subscriptions: Vec<JoinHandle<()>>,
}

/// Typed publish/subscribe over persistent per-category streams.
///
/// Every instance owns its connection. `connect`, `close` and subscription
/// bookkeeping are serialized by the lifecycle mutex, which may be held
/// across a dial. Publishes and status reads never wait on it: they check
/// the connected flag, then clone the broker handle out of a slot that is
/// only locked for the copy.
pub struct EventBus {
    config: EventBusConfig,
    connector: Arc<dyn BrokerConnector>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    broker: RwLock<Option<Arc<dyn Broker>>>,
    link: Arc<Link>,
    errors: Arc<AtomicU64>,
    publish_permits: Arc<Semaphore>,
}

impl EventBus {
    /// Create a disconnected bus.
    pub fn new(config: EventBusConfig, connector: Arc<dyn BrokerConnector>) -> Self {
        let permits = config.max_pub_acks_inflight.max(1);
        Self {
            config,
            connector,
            lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
            broker: RwLock::new(None),
            link: Arc::new(Link::default()),
            errors: Arc::new(AtomicU64::new(0)),
            publish_permits: Arc::new(Semaphore::new(permits)),
        }
    }

    /// Create a disconnected bus backed by NATS JetStream.
    #[cfg(feature = "nats")]
    pub fn nats(config: EventBusConfig) -> Self {
        Self::new(config, Arc::new(NatsConnector))
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    fn resolve_url(&self, url: Option<&str>) -> String {
        [url, Some(self.config.url.as_str())]
            .into_iter()
            .flatten()
            .find(|u| !u.is_empty())
            .unwrap_or(DEFAULT_NATS_URL)
            .to_string()
    }

    /// Connect and provision the three category streams.
    ///
    /// URL precedence: `url` argument, then configured URL, then the local
    /// default. A no-op when already connected. A provisioning failure closes
    /// the fresh connection and is returned. The bus reports connected only
    /// once every stream is in place.
    #[tracing::instrument(name = "bus.connect", skip_all, fields(client_id = %self.config.client_id))]
    pub async fn connect(&self, url: Option<&str>) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.current_broker().is_some() {
            debug!("Event bus already connected");
            return Ok(());
        }

        let url = self.resolve_url(url);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let broker = self
            .connector
            .connect(&url, &self.config, events_tx)
            .await
            .inspect_err(|e| error!(url = %url, error = %e, "Failed to connect to event bus"))?;

        for category in EventCategory::ALL {
            let definition = StreamDefinition::for_category(category, &self.config);
            match broker.ensure_stream(&definition).await {
                Ok(StreamProvisioning::Created) => {
                    info!(stream = %definition.name, subjects = ?definition.subjects, "Created stream");
                }
                Ok(StreamProvisioning::Existing) => {
                    debug!(stream = %definition.name, "Stream already exists");
                }
                Err(e) => {
                    error!(stream = %definition.name, error = %e, "Failed to provision stream");
                    if let Err(close_err) = broker.close().await {
                        warn!(error = %close_err, "Failed to close connection after provisioning error");
                    }
                    return Err(e);
                }
            }
        }

        *self.broker_slot() = Some(broker);
        self.link.mark_connected();
        // Notifications raised while provisioning are still queued for the updater
        lifecycle.status_task = Some(tokio::spawn(run_status_updater(
            events_rx,
            self.link.clone(),
        )));
        info!(url = %url, "Connected to event bus");
        Ok(())
    }

    /// Stop subscriptions, flush and close. Safe to call repeatedly.
    #[tracing::instrument(name = "bus.close", skip_all)]
    pub async fn close(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        for subscription in lifecycle.subscriptions.drain(..) {
            subscription.abort();
        }

        let Some(broker) = self.broker_slot().take() else {
            return Ok(());
        };
        self.link.mark_disconnected();

        let result = broker.close().await;
        if let Some(task) = lifecycle.status_task.take() {
            task.abort();
        }

        match &result {
            Ok(()) => info!("Event bus closed"),
            Err(e) => warn!(error = %e, "Event bus closed with error"),
        }
        result
    }

    /// Whether the broker connection is currently up.
    pub fn is_connected(&self) -> bool {
        self.link.connected.load(Ordering::SeqCst)
    }

    fn broker_slot(&self) -> std::sync::RwLockWriteGuard<'_, Option<Arc<dyn Broker>>> {
        self.broker
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current_broker(&self) -> Option<Arc<dyn Broker>> {
        self.broker
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// The broker handle, or `NotConnected` without waiting on a connect in
    /// progress.
    fn live_broker(&self) -> Result<Arc<dyn Broker>> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        self.current_broker().ok_or(BusError::NotConnected)
    }

    /// Publish an event to its category stream.
    ///
    /// `timestamp` and `source` are overwritten before serialization.
    #[tracing::instrument(name = "bus.publish", skip_all, fields(category = %E::CATEGORY, event_type = event.event_type()))]
    pub async fn publish<E: DomainEvent>(&self, mut event: E) -> Result<()> {
        let broker = self.live_broker()?;

        event.stamp(Utc::now(), &self.config.client_id);
        let subject = event.subject();

        let result = self.send(broker.as_ref(), &event, subject.clone()).await;
        match &result {
            Ok(()) => debug!(subject = %subject, "Published event"),
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                error!(subject = %subject, error = %e, "Failed to publish event");
            }
        }
        result
    }

    async fn send<E: DomainEvent>(
        &self,
        broker: &dyn Broker,
        event: &E,
        subject: String,
    ) -> Result<()> {
        let payload = serde_json::to_vec(event).map_err(|source| BusError::Serialization {
            category: E::CATEGORY,
            source,
        })?;

        let max = self.config.max_payload_bytes;
        if payload.len() > max {
            return Err(BusError::PayloadTooLarge {
                size: payload.len(),
                max,
            });
        }

        let _permit = self
            .publish_permits
            .acquire()
            .await
            .map_err(|e| BusError::Publish {
                subject: subject.clone(),
                message: e.to_string(),
            })?;

        broker.publish(subject, Bytes::from(payload)).await
    }

    pub async fn publish_chat_event(&self, event: ChatEvent) -> Result<()> {
        self.publish(event).await
    }

    pub async fn publish_stream_event(&self, event: StreamEvent) -> Result<()> {
        self.publish(event).await
    }

    pub async fn publish_user_event(&self, event: UserEvent) -> Result<()> {
        self.publish(event).await
    }

    /// Bind the category consumer and process its deliveries in order.
    ///
    /// Handler success acks the message. Handler failures and undecodable
    /// payloads are logged and counted, and the message is left unacked.
    #[tracing::instrument(name = "bus.subscribe", skip_all, fields(category = %E::CATEGORY))]
    pub async fn subscribe<E, H>(&self, handler: H) -> Result<()>
    where
        E: DomainEvent,
        H: EventHandler<E>,
    {
        let broker = self.live_broker()?;

        let spec = ConsumerSpec::for_category(E::CATEGORY, &self.config);
        let deliveries = broker.consume(&spec).await?;

        let errors = self.errors.clone();
        let task = tokio::spawn(run_subscription(deliveries, handler, errors));

        let mut lifecycle = self.lifecycle.lock().await;
        if !self.is_connected() {
            // Closed while the consumer was being bound
            task.abort();
            return Err(BusError::NotConnected);
        }
        lifecycle.subscriptions.push(task);

        info!(
            stream = %spec.stream,
            consumer = ?spec.durable_name,
            "Subscribed to events"
        );
        Ok(())
    }

    pub async fn subscribe_chat_events<H: EventHandler<ChatEvent>>(&self, handler: H) -> Result<()> {
        self.subscribe(handler).await
    }

    pub async fn subscribe_stream_events<H: EventHandler<StreamEvent>>(
        &self,
        handler: H,
    ) -> Result<()> {
        self.subscribe(handler).await
    }

    pub async fn subscribe_user_events<H: EventHandler<UserEvent>>(&self, handler: H) -> Result<()> {
        self.subscribe(handler).await
    }

    /// Snapshot for health endpoints.
    pub async fn status(&self) -> EventBusStatus {
        let stats = self
            .current_broker()
            .map(|broker| broker.statistics())
            .unwrap_or_default();

        EventBusStatus {
            connected: self.is_connected(),
            last_connected: *self.link.last_connected(),
            messages_published: stats.messages_published,
            messages_received: stats.messages_received,
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Applies broker lifecycle notifications to the shared link state.
async fn run_status_updater(mut events: mpsc::UnboundedReceiver<ConnectionEvent>, link: Arc<Link>) {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Connected => {
                link.mark_connected();
                info!("Event bus connection established");
            }
            ConnectionEvent::Disconnected => {
                link.mark_disconnected();
                warn!("Event bus disconnected");
            }
            ConnectionEvent::Closed => {
                link.mark_disconnected();
                info!("Event bus connection closed");
                break;
            }
            ConnectionEvent::Notice(notice) => {
                warn!(notice = %notice, "Event bus notice");
            }
        }
    }
}

async fn run_subscription<E, H>(mut deliveries: DeliveryStream, handler: H, errors: Arc<AtomicU64>)
where
    E: DomainEvent,
    H: EventHandler<E>,
{
    while let Some(next) = deliveries.next().await {
        match next {
            Ok(delivery) => dispatch(&handler, delivery, &errors).await,
            Err(e) => {
                errors.fetch_add(1, Ordering::Relaxed);
                error!(category = %E::CATEGORY, error = %e, "Delivery failed");
            }
        }
    }
    info!(category = %E::CATEGORY, "Subscription ended");
}

async fn dispatch<E, H>(handler: &H, mut delivery: Box<dyn Delivery>, errors: &AtomicU64)
where
    E: DomainEvent,
    H: EventHandler<E>,
{
    let event: E = match serde_json::from_slice(delivery.payload()) {
        Ok(event) => event,
        Err(e) => {
            errors.fetch_add(1, Ordering::Relaxed);
            error!(
                subject = %delivery.subject(),
                error = %e,
                "Failed to deserialize event, leaving unacknowledged"
            );
            return;
        }
    };

    let event_type = event.event_type();
    match handler.handle(event).await {
        Ok(()) => match delivery.ack().await {
            Ok(()) => debug!(event_type, "Event handled"),
            Err(e) => {
                errors.fetch_add(1, Ordering::Relaxed);
                error!(event_type, error = %e, "Failed to ack event");
            }
        },
        Err(e) => {
            errors.fetch_add(1, Ordering::Relaxed);
            error!(event_type, error = %e, "Handler failed, event will be redelivered");
        }
    }
}

#[cfg(test)]
mod tests;
