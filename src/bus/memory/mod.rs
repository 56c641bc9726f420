//! In-memory broker for standalone mode and tests.
//!
//! Mirrors the JetStream behaviors the bus relies on: streams capture
//! subjects by wildcard, named consumers keep their position across
//! reconnects, and unacked deliveries come back after `ack_wait`. Deliveries
//! still unacked when a consumer goes away are replayed when it binds again.
//!
//! The connector hands out the same broker on every dial, so messages and
//! consumer positions survive a bus being closed and reconnected.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

use super::broker::{
    Broker, BrokerConnector, ConnectionEvent, ConsumerSpec, Delivery, DeliveryStream,
    StreamDefinition, StreamProvisioning, TransportStats,
};
use super::{BusError, Result};
use crate::config::EventBusConfig;

type DeliverySender = mpsc::UnboundedSender<Result<Box<dyn Delivery>>>;

/// Sequences handed to a consumer but not acked, with their delivery count.
type Pending = Arc<Mutex<BTreeMap<usize, i64>>>;

fn lock_pending(pending: &Pending) -> MutexGuard<'_, BTreeMap<usize, i64>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Whether a message delivered `attempts` times may not be delivered again.
/// Like JetStream, `max_deliver <= 0` means unlimited.
fn deliveries_exhausted(max_deliver: i64, attempts: i64) -> bool {
    max_deliver > 0 && attempts >= max_deliver
}

/// Check if a subject matches a NATS-style pattern.
///
/// Matching rules:
/// - `*` matches exactly one token
/// - `>` matches one or more trailing tokens
/// - Any other token must match exactly
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut subject_tokens = subject.split('.');
    for token in pattern.split('.') {
        match token {
            ">" => return subject_tokens.next().is_some(),
            "*" => {
                if subject_tokens.next().is_none() {
                    return false;
                }
            }
            literal => {
                if subject_tokens.next() != Some(literal) {
                    return false;
                }
            }
        }
    }
    subject_tokens.next().is_none()
}

#[derive(Clone)]
struct StoredMessage {
    subject: String,
    payload: Bytes,
}

struct Cursor {
    filter: String,
    next: usize,
    ack_wait: Duration,
    max_deliver: i64,
    sender: Option<DeliverySender>,
    pending: Pending,
}

impl Cursor {
    fn redelivery(&self, sender: DeliverySender) -> Redelivery {
        Redelivery {
            sender,
            ack_wait: self.ack_wait,
            max_deliver: self.max_deliver,
            pending: self.pending.clone(),
        }
    }

    /// Hand `message` to the subscriber as its `attempt`-th delivery.
    fn deliver(
        &self,
        sender: &DeliverySender,
        sequence: usize,
        message: &StoredMessage,
        attempt: i64,
    ) -> bool {
        lock_pending(&self.pending).insert(sequence, attempt);
        let delivery = MemoryDelivery {
            sequence,
            message: message.clone(),
            attempt,
            acked: false,
            redelivery: self.redelivery(sender.clone()),
        };
        if sender.send(Ok(Box::new(delivery))).is_err() {
            lock_pending(&self.pending).remove(&sequence);
            return false;
        }
        true
    }

    /// Redeliver everything a previous binding left unacked.
    fn replay(&self, sender: &DeliverySender, messages: &[StoredMessage], received: &AtomicU64) {
        let pending: Vec<(usize, i64)> = lock_pending(&self.pending)
            .iter()
            .map(|(sequence, attempts)| (*sequence, *attempts))
            .collect();

        for (sequence, attempts) in pending {
            if deliveries_exhausted(self.max_deliver, attempts) {
                lock_pending(&self.pending).remove(&sequence);
                continue;
            }
            let Some(message) = messages.get(sequence) else {
                continue;
            };
            if !self.deliver(sender, sequence, message, attempts + 1) {
                return;
            }
            received.fetch_add(1, Ordering::Relaxed);
        }
    }
}

struct MemoryStream {
    definition: StreamDefinition,
    messages: Vec<StoredMessage>,
    consumers: HashMap<String, Cursor>,
    ephemeral_seq: u64,
}

impl MemoryStream {
    /// Push pending messages to every live consumer.
    fn pump(&mut self, received: &AtomicU64) {
        for cursor in self.consumers.values_mut() {
            let Some(sender) = cursor.sender.clone() else {
                continue;
            };
            while cursor.next < self.messages.len() {
                let sequence = cursor.next;
                let message = &self.messages[sequence];
                if !subject_matches(&cursor.filter, &message.subject) {
                    cursor.next += 1;
                    continue;
                }
                if !cursor.deliver(&sender, sequence, message, 1) {
                    // Subscriber gone; keep the position for the next bind
                    cursor.sender = None;
                    break;
                }
                received.fetch_add(1, Ordering::Relaxed);
                cursor.next += 1;
            }
        }
        self.consumers
            .retain(|name, cursor| cursor.sender.is_some() || !name.starts_with(EPHEMERAL_PREFIX));
    }
}

const EPHEMERAL_PREFIX: &str = "_ephemeral.";

#[derive(Default)]
struct Inner {
    open: bool,
    fail_provisioning: bool,
    streams: HashMap<String, MemoryStream>,
    notifier: Option<mpsc::UnboundedSender<ConnectionEvent>>,
}

/// Shared in-memory broker.
#[derive(Default)]
pub struct MemoryBroker {
    inner: Mutex<Inner>,
    published: AtomicU64,
    received: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn open(&self, events: mpsc::UnboundedSender<ConnectionEvent>) {
        let mut inner = self.lock();
        inner.open = true;
        inner.notifier = Some(events);
    }

    /// Make the next stream provisioning fail.
    pub fn fail_provisioning(&self, fail: bool) {
        self.lock().fail_provisioning = fail;
    }

    /// Report a lost connection to the bus.
    pub fn simulate_disconnect(&self) {
        self.notify(ConnectionEvent::Disconnected);
    }

    /// Report a restored connection to the bus.
    pub fn simulate_reconnect(&self) {
        self.notify(ConnectionEvent::Connected);
    }

    fn notify(&self, event: ConnectionEvent) {
        if let Some(notifier) = &self.lock().notifier {
            let _ = notifier.send(event);
        }
    }

    /// Provisioned stream definition, if any.
    pub fn stream(&self, name: &str) -> Option<StreamDefinition> {
        self.lock().streams.get(name).map(|s| s.definition.clone())
    }

    /// Messages stored in a stream.
    pub fn message_count(&self, name: &str) -> usize {
        self.lock()
            .streams
            .get(name)
            .map(|s| s.messages.len())
            .unwrap_or(0)
    }

    /// Store a raw payload, bypassing the bus. Used to inject malformed data.
    pub fn inject(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.append(subject.to_string(), payload)
    }

    fn append(&self, subject: String, payload: Bytes) -> Result<()> {
        let mut inner = self.lock();
        if !inner.open {
            return Err(BusError::Publish {
                subject,
                message: "connection closed".to_string(),
            });
        }

        let stream = inner
            .streams
            .values_mut()
            .find(|s| s.definition.subjects.iter().any(|p| subject_matches(p, &subject)))
            .ok_or_else(|| BusError::Publish {
                subject: subject.clone(),
                message: "no stream captures subject".to_string(),
            })?;

        stream.messages.push(StoredMessage { subject, payload });
        self.published.fetch_add(1, Ordering::Relaxed);
        stream.pump(&self.received);
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn ensure_stream(&self, definition: &StreamDefinition) -> Result<StreamProvisioning> {
        let mut inner = self.lock();
        if inner.fail_provisioning {
            return Err(BusError::Provisioning {
                stream: definition.name.clone(),
                message: "provisioning disabled".to_string(),
            });
        }
        if inner.streams.contains_key(&definition.name) {
            return Ok(StreamProvisioning::Existing);
        }
        inner.streams.insert(
            definition.name.clone(),
            MemoryStream {
                definition: definition.clone(),
                messages: Vec::new(),
                consumers: HashMap::new(),
                ephemeral_seq: 0,
            },
        );
        Ok(StreamProvisioning::Created)
    }

    async fn publish(&self, subject: String, payload: Bytes) -> Result<()> {
        self.append(subject, payload)
    }

    async fn consume(&self, spec: &ConsumerSpec) -> Result<DeliveryStream> {
        let mut inner = self.lock();
        if !inner.open {
            return Err(BusError::NotConnected);
        }
        let stream = inner
            .streams
            .get_mut(&spec.stream)
            .ok_or_else(|| BusError::Subscribe(format!("stream '{}' not found", spec.stream)))?;

        let name = match &spec.durable_name {
            Some(name) => name.clone(),
            None => {
                stream.ephemeral_seq += 1;
                format!("{}{}", EPHEMERAL_PREFIX, stream.ephemeral_seq)
            }
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        let cursor = stream.consumers.entry(name.clone()).or_insert_with(|| Cursor {
            filter: spec.filter_subject.clone(),
            next: 0,
            ack_wait: spec.ack_wait,
            max_deliver: spec.max_deliver,
            sender: None,
            pending: Pending::default(),
        });
        cursor.sender = Some(sender.clone());
        debug!(
            stream = %spec.stream,
            consumer = %name,
            position = cursor.next,
            unacked = lock_pending(&cursor.pending).len(),
            "Bound memory consumer"
        );
        cursor.replay(&sender, &stream.messages, &self.received);

        stream.pump(&self.received);
        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    fn statistics(&self) -> TransportStats {
        TransportStats {
            messages_published: self.published.load(Ordering::Relaxed),
            messages_received: self.received.load(Ordering::Relaxed),
        }
    }

    async fn close(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.open = false;
        for stream in inner.streams.values_mut() {
            for cursor in stream.consumers.values_mut() {
                cursor.sender = None;
            }
        }
        if let Some(notifier) = inner.notifier.take() {
            let _ = notifier.send(ConnectionEvent::Closed);
        }
        Ok(())
    }
}

/// Dials the shared [`MemoryBroker`].
#[derive(Clone, Default)]
pub struct MemoryConnector {
    broker: Arc<MemoryBroker>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The broker every dial returns.
    pub fn broker(&self) -> Arc<MemoryBroker> {
        self.broker.clone()
    }
}

#[async_trait]
impl BrokerConnector for MemoryConnector {
    async fn connect(
        &self,
        url: &str,
        _config: &EventBusConfig,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn Broker>> {
        self.broker.open(events);
        info!(url = %url, "Connected to memory broker");
        let broker: Arc<dyn Broker> = self.broker.clone();
        Ok(broker)
    }
}

// ============================================================================
// Deliveries
// ============================================================================

#[derive(Clone)]
struct Redelivery {
    sender: DeliverySender,
    ack_wait: Duration,
    max_deliver: i64,
    pending: Pending,
}

struct MemoryDelivery {
    sequence: usize,
    message: StoredMessage,
    attempt: i64,
    acked: bool,
    redelivery: Redelivery,
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn subject(&self) -> &str {
        &self.message.subject
    }

    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    async fn ack(&mut self) -> Result<()> {
        self.acked = true;
        lock_pending(&self.redelivery.pending).remove(&self.sequence);
        Ok(())
    }
}

impl Drop for MemoryDelivery {
    fn drop(&mut self) {
        if self.acked {
            return;
        }
        if deliveries_exhausted(self.redelivery.max_deliver, self.attempt) {
            debug!(subject = %self.message.subject, attempts = self.attempt, "Max deliveries reached");
            lock_pending(&self.redelivery.pending).remove(&self.sequence);
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let next = MemoryDelivery {
            sequence: self.sequence,
            message: self.message.clone(),
            attempt: self.attempt + 1,
            // Armed only once handed back to the subscriber
            acked: true,
            redelivery: self.redelivery.clone(),
        };
        runtime.spawn(async move {
            let mut next = next;
            tokio::time::sleep(next.redelivery.ack_wait).await;
            let sender = next.redelivery.sender.clone();
            // A closed subscriber leaves the sequence pending for the next bind
            if sender.is_closed() {
                return;
            }
            {
                let mut pending = lock_pending(&next.redelivery.pending);
                let Some(attempts) = pending.get_mut(&next.sequence) else {
                    // Acked through another delivery
                    return;
                };
                *attempts = next.attempt;
            }
            next.acked = false;
            let _ = sender.send(Ok(Box::new(next)));
        });
    }
}
