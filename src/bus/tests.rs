use super::*;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

use crate::events::{ChatEventType, EventEnvelope, UserEventType};

fn test_config() -> EventBusConfig {
    EventBusConfig {
        ack_wait_ms: 20,
        ..EventBusConfig::default()
    }
}

fn memory_bus() -> (EventBus, MemoryConnector) {
    let connector = MemoryConnector::new();
    let bus = EventBus::new(test_config(), Arc::new(connector.clone()));
    (bus, connector)
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("channel closed")
}

#[tokio::test]
async fn test_publish_before_connect_fails_fast() {
    let (bus, _) = memory_bus();

    let result = bus
        .publish_chat_event(ChatEvent::new(ChatEventType::Message, 1))
        .await;

    assert!(matches!(result, Err(BusError::NotConnected)));
    assert!(!bus.is_connected());
}

#[tokio::test]
async fn test_connect_provisions_category_streams() {
    let (bus, connector) = memory_bus();
    bus.connect(None).await.unwrap();

    let broker = connector.broker();
    for category in EventCategory::ALL {
        let stream = broker.stream(category.stream_name()).unwrap();
        assert_eq!(stream.subjects, vec![category.subject_wildcard()]);
        assert_eq!(stream.max_age, category.default_max_age());
        assert!(stream.durable_storage);
    }
}

#[tokio::test]
async fn test_connect_and_close_are_idempotent() {
    let (bus, _) = memory_bus();

    bus.connect(Some("memory://a")).await.unwrap();
    bus.connect(Some("memory://b")).await.unwrap();
    assert!(bus.is_connected());

    bus.close().await.unwrap();
    bus.close().await.unwrap();
    assert!(!bus.is_connected());
}

#[tokio::test]
async fn test_provisioning_failure_fails_connect() {
    let (bus, connector) = memory_bus();
    connector.broker().fail_provisioning(true);

    let result = bus.connect(None).await;

    assert!(matches!(result, Err(BusError::Provisioning { .. })));
    assert!(!bus.is_connected());
    assert!(!bus.status().await.connected);

    connector.broker().fail_provisioning(false);
    bus.connect(None).await.unwrap();
    assert!(bus.is_connected());
}

#[tokio::test]
async fn test_subscriber_sees_stamped_event() {
    let (bus, _) = memory_bus();
    bus.connect(None).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe_chat_events(move |event: ChatEvent| {
        let tx = tx.clone();
        async move {
            tx.send(event)?;
            Ok::<(), HandlerError>(())
        }
    })
    .await
    .unwrap();

    let mut event = ChatEvent::new(ChatEventType::Message, 42)
        .with_room("r1")
        .with_trace_id("t-1");
    event.base.source = "caller".to_string();
    event.base.timestamp = Utc::now() - chrono::Duration::days(3);

    let before = Utc::now();
    bus.publish_chat_event(event).await.unwrap();

    let received = recv(&mut rx).await;
    assert_eq!(received.base.event_type, ChatEventType::Message);
    assert_eq!(received.room_id, "r1");
    assert_eq!(received.base.user_id, 42);
    assert_eq!(received.base.trace_id, "t-1");
    assert_eq!(received.base.source, "veza-backend");
    assert!(received.base.timestamp >= before);
    assert!(received.base.timestamp - before < chrono::Duration::seconds(5));
}

#[tokio::test]
async fn test_failing_handler_gets_redelivery() {
    let (bus, _) = memory_bus();
    bus.connect(None).await.unwrap();

    const FAILURES: u32 = 2;
    let calls = Arc::new(AtomicU32::new(0));
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();

    let counter = calls.clone();
    bus.subscribe_user_events(move |_event: UserEvent| {
        let counter = counter.clone();
        let done_tx = done_tx.clone();
        async move {
            let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= FAILURES {
                return Err::<(), HandlerError>(format!("attempt {} failed", call).into());
            }
            let _ = done_tx.send(call);
            Ok(())
        }
    })
    .await
    .unwrap();

    bus.publish_user_event(UserEvent::new(UserEventType::Registered, 9).with_email("a@b.c"))
        .await
        .unwrap();

    assert_eq!(recv(&mut done_rx).await, FAILURES + 1);

    // Acked on success, so nothing more arrives
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), FAILURES + 1);
    assert_eq!(bus.status().await.errors, u64::from(FAILURES));
}

#[tokio::test]
async fn test_malformed_payload_is_counted_and_skipped() {
    let (bus, connector) = memory_bus();
    bus.connect(None).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe_chat_events(move |event: ChatEvent| {
        let tx = tx.clone();
        async move {
            tx.send(event.room_id)?;
            Ok::<(), HandlerError>(())
        }
    })
    .await
    .unwrap();

    connector
        .broker()
        .inject("chat.events.chat.message", Bytes::from_static(b"not json"))
        .unwrap();
    bus.publish_chat_event(ChatEvent::new(ChatEventType::Message, 1).with_room("ok"))
        .await
        .unwrap();

    assert_eq!(recv(&mut rx).await, "ok");
    assert!(bus.status().await.errors >= 1);
}

#[tokio::test]
async fn test_oversized_payload_is_rejected() {
    let connector = MemoryConnector::new();
    let config = EventBusConfig {
        max_payload_bytes: 64,
        ..test_config()
    };
    let bus = EventBus::new(config, Arc::new(connector.clone()));
    bus.connect(None).await.unwrap();

    let event = ChatEvent::new(ChatEventType::Message, 1)
        .with_data(serde_json::json!({"content": "x".repeat(128)}));
    let result = bus.publish_chat_event(event).await;

    assert!(matches!(result, Err(BusError::PayloadTooLarge { max: 64, .. })));
    assert_eq!(connector.broker().message_count("CHAT_EVENTS"), 0);
    assert_eq!(bus.status().await.errors, 1);
}

#[tokio::test]
async fn test_disconnect_notification_blocks_publish() {
    let (bus, connector) = memory_bus();
    bus.connect(None).await.unwrap();

    connector.broker().simulate_disconnect();
    eventually(|| !bus.is_connected()).await;

    let result = bus
        .publish_stream_event(StreamEvent::new(crate::events::StreamEventType::Started, 1))
        .await;
    assert!(matches!(result, Err(BusError::NotConnected)));

    connector.broker().simulate_reconnect();
    eventually(|| bus.is_connected()).await;

    bus.publish_stream_event(StreamEvent::new(crate::events::StreamEventType::Started, 1))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_durable_consumer_survives_bus_restart() {
    let connector = MemoryConnector::new();

    let first = EventBus::new(test_config(), Arc::new(connector.clone()));
    first.connect(None).await.unwrap();
    first
        .publish_chat_event(ChatEvent::new(ChatEventType::RoomCreated, 5).with_room("r9"))
        .await
        .unwrap();
    first.close().await.unwrap();

    let second = EventBus::new(test_config(), Arc::new(connector.clone()));
    second.connect(None).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    second
        .subscribe_chat_events(move |event: ChatEvent| {
            let tx = tx.clone();
            async move {
                tx.send(event.room_id)?;
                Ok::<(), HandlerError>(())
            }
        })
        .await
        .unwrap();

    assert_eq!(recv(&mut rx).await, "r9");
}

#[tokio::test]
async fn test_status_reports_traffic() {
    let (bus, _) = memory_bus();
    assert_eq!(bus.status().await.last_connected, None);

    bus.connect(None).await.unwrap();
    bus.publish_chat_event(ChatEvent::new(ChatEventType::Message, 1))
        .await
        .unwrap();

    let status = bus.status().await;
    assert!(status.connected);
    assert!(status.last_connected.is_some());
    assert_eq!(status.messages_published, 1);
    assert_eq!(status.errors, 0);
}

/// Memory broker whose stream provisioning waits for a permit.
struct GatedBroker {
    inner: Arc<MemoryBroker>,
    gate: Arc<Semaphore>,
}

#[async_trait::async_trait]
impl Broker for GatedBroker {
    async fn ensure_stream(&self, definition: &StreamDefinition) -> Result<StreamProvisioning> {
        let _permit = self.gate.acquire().await.map_err(|e| BusError::Provisioning {
            stream: definition.name.clone(),
            message: e.to_string(),
        })?;
        self.inner.ensure_stream(definition).await
    }

    async fn publish(&self, subject: String, payload: Bytes) -> Result<()> {
        self.inner.publish(subject, payload).await
    }

    async fn consume(&self, spec: &ConsumerSpec) -> Result<DeliveryStream> {
        self.inner.consume(spec).await
    }

    fn statistics(&self) -> TransportStats {
        self.inner.statistics()
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

struct GatedConnector {
    memory: MemoryConnector,
    gate: Arc<Semaphore>,
}

#[async_trait::async_trait]
impl BrokerConnector for GatedConnector {
    async fn connect(
        &self,
        url: &str,
        config: &EventBusConfig,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn Broker>> {
        self.memory.connect(url, config, events).await?;
        let broker: Arc<dyn Broker> = Arc::new(GatedBroker {
            inner: self.memory.broker(),
            gate: self.gate.clone(),
        });
        Ok(broker)
    }
}

#[tokio::test]
async fn test_operations_fail_fast_while_connect_is_in_progress() {
    let gate = Arc::new(Semaphore::new(0));
    let connector = GatedConnector {
        memory: MemoryConnector::new(),
        gate: gate.clone(),
    };
    let bus = Arc::new(EventBus::new(test_config(), Arc::new(connector)));

    let connecting = {
        let bus = bus.clone();
        tokio::spawn(async move { bus.connect(None).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let quick = Duration::from_millis(200);
    let published = tokio::time::timeout(
        quick,
        bus.publish_chat_event(ChatEvent::new(ChatEventType::Message, 1)),
    )
    .await
    .expect("publish waited on connect");
    assert!(matches!(published, Err(BusError::NotConnected)));

    let subscribed = tokio::time::timeout(
        quick,
        bus.subscribe_chat_events(|_event: ChatEvent| async { Ok::<(), HandlerError>(()) }),
    )
    .await
    .expect("subscribe waited on connect");
    assert!(matches!(subscribed, Err(BusError::NotConnected)));

    let status = tokio::time::timeout(quick, bus.status())
        .await
        .expect("status waited on connect");
    assert!(!status.connected);
    assert_eq!(status.last_connected, None);
    assert!(!bus.is_connected());

    gate.add_permits(1);
    connecting.await.unwrap().unwrap();

    assert!(bus.is_connected());
    bus.publish_chat_event(ChatEvent::new(ChatEventType::Message, 1))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_unacked_event_survives_bus_restart() {
    let connector = MemoryConnector::new();

    let first = EventBus::new(test_config(), Arc::new(connector.clone()));
    first.connect(None).await.unwrap();
    let (failed_tx, mut failed_rx) = mpsc::unbounded_channel();
    first
        .subscribe_chat_events(move |event: ChatEvent| {
            let failed_tx = failed_tx.clone();
            async move {
                let _ = failed_tx.send(event.room_id);
                Err::<(), HandlerError>("handler unavailable".into())
            }
        })
        .await
        .unwrap();

    first
        .publish_chat_event(ChatEvent::new(ChatEventType::Message, 3).with_room("unacked"))
        .await
        .unwrap();
    assert_eq!(recv(&mut failed_rx).await, "unacked");
    first.close().await.unwrap();

    let second = EventBus::new(test_config(), Arc::new(connector.clone()));
    second.connect(None).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    second
        .subscribe_chat_events(move |event: ChatEvent| {
            let tx = tx.clone();
            async move {
                tx.send(event.room_id)?;
                Ok::<(), HandlerError>(())
            }
        })
        .await
        .unwrap();

    assert_eq!(recv(&mut rx).await, "unacked");
}
