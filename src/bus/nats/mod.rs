//! NATS JetStream broker.
//!
//! - Each category maps to a JetStream stream (`CHAT_EVENTS`, ...)
//! - Publishes wait for the JetStream ack
//! - Consumers are pull consumers with `AckPolicy::Explicit`
//! - Connection lifecycle callbacks are forwarded as [`ConnectionEvent`]s

use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_nats::jetstream::{self, consumer, stream};
use async_nats::{ConnectOptions, Event};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::broker::{
    Broker, BrokerConnector, ConnectionEvent, ConsumerSpec, Delivery, DeliveryStream,
    StreamDefinition, StreamProvisioning, TransportStats,
};
use super::{BusError, Result};
use crate::config::EventBusConfig;

/// Dials NATS and opens a JetStream context.
#[derive(Debug, Clone, Copy, Default)]
pub struct NatsConnector;

fn connection_event(event: Event) -> ConnectionEvent {
    match event {
        Event::Connected => ConnectionEvent::Connected,
        Event::Disconnected => ConnectionEvent::Disconnected,
        Event::Closed => ConnectionEvent::Closed,
        other => ConnectionEvent::Notice(other.to_string()),
    }
}

#[async_trait]
impl BrokerConnector for NatsConnector {
    async fn connect(
        &self,
        url: &str,
        config: &EventBusConfig,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn Broker>> {
        let reconnect_wait = config.reconnect_wait();

        let client = ConnectOptions::new()
            .name(&config.client_id)
            .connection_timeout(config.connect_timeout())
            .max_reconnects(config.max_reconnects)
            .reconnect_delay_callback(move |_attempts| reconnect_wait)
            .subscription_capacity(config.subscription_capacity)
            .client_capacity(config.client_capacity)
            .event_callback(move |event| {
                let events = events.clone();
                let event = connection_event(event);
                async move {
                    let _ = events.send(event);
                }
            })
            .connect(url)
            .await
            .map_err(|e| BusError::Connection(format!("failed to connect to {}: {}", url, e)))?;

        info!(url = %url, client_id = %config.client_id, "Connected to NATS");

        let jetstream = jetstream::new(client.clone());
        let broker: Arc<dyn Broker> = Arc::new(NatsBroker { client, jetstream });
        Ok(broker)
    }
}

/// Live NATS connection with its JetStream context.
pub struct NatsBroker {
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

#[async_trait]
impl Broker for NatsBroker {
    async fn ensure_stream(&self, definition: &StreamDefinition) -> Result<StreamProvisioning> {
        if self.jetstream.get_stream(&definition.name).await.is_ok() {
            return Ok(StreamProvisioning::Existing);
        }

        let storage = if definition.durable_storage {
            stream::StorageType::File
        } else {
            stream::StorageType::Memory
        };

        self.jetstream
            .create_stream(stream::Config {
                name: definition.name.clone(),
                subjects: definition.subjects.clone(),
                retention: stream::RetentionPolicy::Limits,
                storage,
                max_age: definition.max_age,
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::Provisioning {
                stream: definition.name.clone(),
                message: e.to_string(),
            })?;

        Ok(StreamProvisioning::Created)
    }

    async fn publish(&self, subject: String, payload: Bytes) -> Result<()> {
        let publish_error = |message: String| BusError::Publish {
            subject: subject.clone(),
            message,
        };

        let ack = self
            .jetstream
            .publish(subject.clone(), payload)
            .await
            .map_err(|e| publish_error(e.to_string()))?;
        let ack = ack.await.map_err(|e| publish_error(e.to_string()))?;

        debug!(subject = %subject, stream = %ack.stream, sequence = ack.sequence, "Publish acknowledged");
        Ok(())
    }

    async fn consume(&self, spec: &ConsumerSpec) -> Result<DeliveryStream> {
        let stream = self
            .jetstream
            .get_stream(&spec.stream)
            .await
            .map_err(|e| BusError::Subscribe(format!("stream '{}': {}", spec.stream, e)))?;

        let config = consumer::pull::Config {
            durable_name: spec.durable_name.clone(),
            name: spec.durable_name.clone(),
            filter_subject: spec.filter_subject.clone(),
            ack_policy: consumer::AckPolicy::Explicit,
            ack_wait: spec.ack_wait,
            max_deliver: spec.max_deliver,
            deliver_policy: consumer::DeliverPolicy::All,
            ..Default::default()
        };

        let consumer = match &spec.durable_name {
            Some(name) => stream.get_or_create_consumer(name, config).await,
            None => stream.create_consumer(config).await,
        }
        .map_err(|e| BusError::Subscribe(e.to_string()))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;

        let deliveries = messages.map(|next| match next {
            Ok(message) => Ok(Box::new(NatsDelivery { message }) as Box<dyn Delivery>),
            Err(e) => Err(BusError::Subscribe(e.to_string())),
        });
        Ok(deliveries.boxed())
    }

    fn statistics(&self) -> TransportStats {
        let stats = self.client.statistics();
        TransportStats {
            messages_published: stats.out_messages.load(Ordering::Relaxed),
            messages_received: stats.in_messages.load(Ordering::Relaxed),
        }
    }

    async fn close(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| BusError::Connection(format!("flush failed: {}", e)))?;
        self.client
            .drain()
            .await
            .map_err(|e| BusError::Connection(format!("drain failed: {}", e)))
    }
}

struct NatsDelivery {
    message: jetstream::Message,
}

#[async_trait]
impl Delivery for NatsDelivery {
    fn subject(&self) -> &str {
        self.message.subject.as_str()
    }

    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    async fn ack(&mut self) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| BusError::Ack(e.to_string()))
    }
}
