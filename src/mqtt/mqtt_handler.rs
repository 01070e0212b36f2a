use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Local};
use rumqttc::ConnectReturnCode;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::MqttConfig;
use super::error::MqttError;
use super::message_manager::{MessageRecord, MessageRecorder, Payload};
use super::subscriptions::SubscriptionRegistry;
use super::transport::{RumqttTransport, Transport, TransportEvent};

/// Buffer between the transport pump and the manager's event loop
const EVENT_CAPACITY: usize = 100;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MqttStatus {
    pub connected: bool,
    pub state: ConnectionState,
    pub subscribed_topics: BTreeSet<String>,
    pub messages_sent: usize,
    pub messages_received: usize,
    pub last_activity: Option<DateTime<Local>>,
}

// Everything behind the manager's single lock.
#[derive(Default)]
struct Shared {
    state: ConnectionState,
    subscriptions: SubscriptionRegistry,
    messages_sent: usize,
    messages_received: usize,
    last_activity: Option<DateTime<Local>>,
}

/// Owns the broker connection for the whole process.
///
/// Cloning is cheap and every clone talks to the same connection, so one
/// manager is built at startup and handed to whoever needs it. All public
/// operations log their failures and report them as `false`; nothing here
/// returns an error to the caller.
///
/// Reconnection is reactive: a lost connection stays `Disconnected` until the
/// next `publish` or `subscribe` triggers a fresh `connect`.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Mutex<Shared>>,
    transport: Arc<dyn Transport>,
    recorder: Arc<dyn MessageRecorder>,
    cancel: CancellationToken,
}

impl ConnectionManager {
    /// Builds a manager without an event loop; events go through
    /// [`ConnectionManager::handle_event`].
    pub fn new(transport: Arc<dyn Transport>, recorder: Arc<dyn MessageRecorder>) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared::default())),
            transport,
            recorder,
            cancel: CancellationToken::new(),
        }
    }

    /// Builds a manager and spawns the task that consumes transport events.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        recorder: Arc<dyn MessageRecorder>,
        events: mpsc::Receiver<TransportEvent>,
    ) -> Self {
        let manager = Self::new(transport, recorder);
        tokio::spawn(manager.clone().run_event_loop(events));
        manager
    }

    /// Wires a rumqttc transport for `config` to a freshly spawned manager.
    pub fn from_config(config: &MqttConfig, recorder: Arc<dyn MessageRecorder>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let transport = Arc::new(RumqttTransport::new(config.clone(), event_tx));
        Self::spawn(transport, recorder, event_rx)
    }

    async fn run_event_loop(self, mut events: mpsc::Receiver<TransportEvent>) {
        debug!("MQTT event loop started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        warn!("Transport event channel closed");
                        break;
                    }
                }
            }
        }
        info!("MQTT event loop terminated");
    }

    /// Applies one lifecycle event to the state machine.
    pub async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::ConnAck(code) => self.on_connect_ack(code).await,
            TransportEvent::Message { topic, payload } => self.on_message(topic, payload).await,
            TransportEvent::Disconnected { reason } => self.on_disconnect(&reason).await,
        }
    }

    async fn on_connect_ack(&self, code: ConnectReturnCode) {
        if code != ConnectReturnCode::Success {
            error!("Broker refused connection with code {:?}", code);
            self.shared.lock().await.state = ConnectionState::Disconnected;
            return;
        }

        // Requests go out while the lock is held so they stay ordered with a
        // concurrent unsubscribe of the same topic.
        let mut shared = self.shared.lock().await;
        shared.state = ConnectionState::Connected;
        let topics = shared.subscriptions.snapshot();
        info!("MQTT connected, restoring {} subscription(s)", topics.len());

        for topic in topics {
            if let Err(source) = self.transport.subscribe(&topic).await {
                error!("{}", MqttError::SubscribeFailed { topic, source });
            }
        }
    }

    async fn on_message(&self, topic: String, payload: Vec<u8>) {
        let payload = match String::from_utf8(payload) {
            Ok(payload) => payload,
            Err(source) => {
                warn!("Dropping message: {}", MqttError::DecodeFailed { topic, source });
                return;
            }
        };
        info!("Received message: {} - {}", topic, payload);

        {
            let mut shared = self.shared.lock().await;
            shared.messages_received += 1;
            shared.last_activity = Some(Local::now());
        }
        self.record(MessageRecord::received(topic, payload)).await;
    }

    async fn on_disconnect(&self, reason: &str) {
        self.shared.lock().await.state = ConnectionState::Disconnected;
        info!("MQTT disconnected: {}", reason);
    }

    /// Opens a session unless one is already being opened or is up.
    pub async fn connect(&self) {
        if let Err(e) = self.try_connect().await {
            error!("{}", e);
        }
    }

    async fn try_connect(&self) -> Result<(), MqttError> {
        if self.cancel.is_cancelled() {
            return Err(MqttError::Closed);
        }
        {
            let mut shared = self.shared.lock().await;
            if shared.state != ConnectionState::Disconnected {
                debug!("Connect skipped, state is {:?}", shared.state);
                return Ok(());
            }
            shared.state = ConnectionState::Connecting;
        }

        if let Err(e) = self.transport.connect().await {
            let mut shared = self.shared.lock().await;
            if shared.state == ConnectionState::Connecting {
                shared.state = ConnectionState::Disconnected;
            }
            return Err(MqttError::ConnectFailed(e));
        }
        Ok(())
    }

    // One synchronous connect attempt when the connection is not up.
    async fn ensure_connected(&self) -> bool {
        if self.shared.lock().await.state == ConnectionState::Connected {
            return true;
        }
        match self.try_connect().await {
            Ok(()) => true,
            Err(e) => {
                error!("{}", e);
                false
            }
        }
    }

    /// Publishes `payload` on `topic` and records it as sent.
    ///
    /// Structured payloads are serialized to JSON, text goes out unchanged.
    pub async fn publish(&self, topic: &str, payload: impl Into<Payload>) -> bool {
        if topic.is_empty() {
            error!("Refusing to publish: topic is empty");
            return false;
        }
        let payload = match payload.into().into_wire() {
            Ok(payload) => payload,
            Err(e) => {
                error!("{}", MqttError::Serialize(e));
                return false;
            }
        };

        if !self.ensure_connected().await {
            error!("Message to {} not sent, broker unreachable", topic);
            return false;
        }

        if let Err(source) = self.transport.publish(topic, &payload).await {
            error!(
                "{}",
                MqttError::PublishFailed {
                    topic: topic.to_string(),
                    source,
                }
            );
            return false;
        }

        {
            let mut shared = self.shared.lock().await;
            shared.messages_sent += 1;
            shared.last_activity = Some(Local::now());
        }
        info!("Message sent: {} - {}", topic, payload);
        self.record(MessageRecord::sent(topic, payload)).await;
        true
    }

    /// Subscribes to `topic` and remembers it for every later reconnect.
    ///
    /// The intent is kept even when the request cannot be transmitted right
    /// now. Only a request the transport rejects outright (bad filter) returns
    /// `false` and leaves the registry as it was.
    pub async fn subscribe(&self, topic: &str) -> bool {
        if topic.is_empty() {
            error!("Refusing to subscribe: topic is empty");
            return false;
        }
        if self.cancel.is_cancelled() {
            error!("Refusing to subscribe to {}: {}", topic, MqttError::Closed);
            return false;
        }
        self.ensure_connected().await;

        // Registry and request change together under the lock, so a CONNACK
        // racing with us either resubscribes this topic or runs after us.
        let mut shared = self.shared.lock().await;
        let inserted = shared.subscriptions.add(topic);

        match self.transport.subscribe(topic).await {
            Ok(()) => {
                info!("Subscribed to topic: {}", topic);
                true
            }
            Err(source) if source.is_rejection() => {
                if inserted {
                    shared.subscriptions.remove(topic);
                }
                error!(
                    "{}",
                    MqttError::SubscribeFailed {
                        topic: topic.to_string(),
                        source,
                    }
                );
                false
            }
            Err(source) => {
                warn!(
                    "{}, retrying on next connect",
                    MqttError::SubscribeFailed {
                        topic: topic.to_string(),
                        source,
                    }
                );
                true
            }
        }
    }

    /// Unsubscribes from `topic` and forgets it.
    ///
    /// A transmission failure still drops the topic from the registry; only a
    /// rejected request keeps it.
    pub async fn unsubscribe(&self, topic: &str) -> bool {
        if topic.is_empty() {
            error!("Refusing to unsubscribe: topic is empty");
            return false;
        }

        let mut shared = self.shared.lock().await;
        match self.transport.unsubscribe(topic).await {
            Err(source) if source.is_rejection() => {
                error!(
                    "{}",
                    MqttError::UnsubscribeFailed {
                        topic: topic.to_string(),
                        source,
                    }
                );
                return false;
            }
            Err(source) => warn!(
                "{}",
                MqttError::UnsubscribeFailed {
                    topic: topic.to_string(),
                    source,
                }
            ),
            Ok(()) => {}
        }

        shared.subscriptions.remove(topic);
        info!("Unsubscribed from topic: {}", topic);
        true
    }

    pub async fn status(&self) -> MqttStatus {
        let shared = self.shared.lock().await;
        MqttStatus {
            connected: shared.state == ConnectionState::Connected,
            state: shared.state,
            subscribed_topics: shared.subscriptions.snapshot(),
            messages_sent: shared.messages_sent,
            messages_received: shared.messages_received,
            last_activity: shared.last_activity,
        }
    }

    /// Stops the event loop and closes the broker session.
    pub async fn close(&self) {
        self.cancel.cancel();
        if let Err(e) = self.transport.disconnect().await {
            warn!("Failed to disconnect cleanly: {}", e);
        }
        self.shared.lock().await.state = ConnectionState::Disconnected;
        info!("MQTT connection manager closed");
    }

    async fn record(&self, record: MessageRecord) {
        let topic = record.topic.clone();
        if let Err(source) = self.recorder.append(record).await {
            error!("{}", MqttError::StoreFailed { topic, source });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::message_manager::Direction;
    use crate::mqtt::testing::{Call, MemoryRecorder, ScriptedTransport};
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn manager() -> (ConnectionManager, Arc<ScriptedTransport>, Arc<MemoryRecorder>) {
        let transport = Arc::new(ScriptedTransport::new());
        let recorder = Arc::new(MemoryRecorder::new());
        let manager = ConnectionManager::new(transport.clone(), recorder.clone());
        (manager, transport, recorder)
    }

    async fn connected() -> (ConnectionManager, Arc<ScriptedTransport>, Arc<MemoryRecorder>) {
        let (manager, transport, recorder) = manager();
        manager.connect().await;
        manager
            .handle_event(TransportEvent::ConnAck(ConnectReturnCode::Success))
            .await;
        (manager, transport, recorder)
    }

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn connect_is_idempotent_while_connected() {
        let (manager, transport, _) = connected().await;
        assert!(manager.status().await.connected);

        manager.connect().await;
        manager.connect().await;

        assert_eq!(transport.count(&Call::Connect), 1);
    }

    #[tokio::test]
    async fn connect_is_skipped_while_connecting() {
        let (manager, transport, _) = manager();
        manager.connect().await;
        assert_eq!(manager.status().await.state, ConnectionState::Connecting);

        manager.connect().await;
        assert_eq!(transport.count(&Call::Connect), 1);
    }

    #[tokio::test]
    async fn failed_connect_stays_disconnected_and_retries_lazily() {
        let (manager, transport, recorder) = manager();
        transport.fail_connect.store(true, Ordering::SeqCst);

        manager.connect().await;
        assert_eq!(manager.status().await.state, ConnectionState::Disconnected);
        assert_eq!(transport.count(&Call::Connect), 1);

        assert!(!manager.publish("lamp/set", "on").await);
        assert_eq!(transport.count(&Call::Connect), 2);
        assert!(recorder.records().is_empty());
    }

    #[tokio::test]
    async fn publish_while_disconnected_connects_first() {
        let (manager, transport, recorder) = manager();

        assert!(manager.publish("lamp/set", "on").await);

        assert_eq!(
            transport.calls(),
            vec![
                Call::Connect,
                Call::Publish {
                    topic: "lamp/set".to_string(),
                    payload: "on".to_string()
                }
            ]
        );
        assert_eq!(recorder.records().len(), 1);
    }

    #[tokio::test]
    async fn structured_payload_is_sent_and_recorded_as_json() {
        let (manager, transport, recorder) = connected().await;

        assert!(manager.publish("lamp/set", json!({"cmd": "on"})).await);

        let sent = transport
            .calls()
            .into_iter()
            .find_map(|call| match call {
                Call::Publish { payload, .. } => Some(payload),
                _ => None,
            })
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&sent).unwrap();
        assert_eq!(parsed, json!({"cmd": "on"}));

        let records = recorder.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].direction, Direction::Sent);
        assert_eq!(records[0].payload, sent);
        assert_eq!(manager.status().await.messages_sent, 1);
    }

    #[tokio::test]
    async fn text_payload_is_not_validated() {
        let (manager, transport, _) = connected().await;

        assert!(manager.publish("raw", "{broken").await);
        assert_eq!(
            transport.count(&Call::Publish {
                topic: "raw".to_string(),
                payload: "{broken".to_string()
            }),
            1
        );
    }

    #[tokio::test]
    async fn failed_publish_returns_false_without_record() {
        let (manager, transport, recorder) = connected().await;
        transport.fail_publish.store(true, Ordering::SeqCst);

        assert!(!manager.publish("lamp/set", "on").await);
        assert!(recorder.records().is_empty());
        assert_eq!(manager.status().await.messages_sent, 0);
    }

    #[tokio::test]
    async fn empty_topic_is_refused_without_io() {
        let (manager, transport, _) = manager();

        assert!(!manager.publish("", "on").await);
        assert!(!manager.subscribe("").await);
        assert!(!manager.unsubscribe("").await);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn store_failure_does_not_fail_publish() {
        let (manager, _, recorder) = connected().await;
        recorder.fail.store(true, Ordering::SeqCst);

        assert!(manager.publish("lamp/set", "on").await);
        assert!(recorder.records().is_empty());
    }

    #[tokio::test]
    async fn reconnect_resubscribes_each_topic_exactly_once() {
        let (manager, transport, _) = connected().await;
        assert!(manager.subscribe("a").await);
        assert!(manager.subscribe("sensors/#").await);

        for _ in 0..2 {
            transport.clear_calls();
            manager
                .handle_event(TransportEvent::Disconnected {
                    reason: "network down".to_string(),
                })
                .await;
            assert!(!manager.status().await.connected);

            manager
                .handle_event(TransportEvent::ConnAck(ConnectReturnCode::Success))
                .await;

            assert!(manager.status().await.connected);
            assert_eq!(transport.count(&Call::Subscribe("a".to_string())), 1);
            assert_eq!(transport.count(&Call::Subscribe("sensors/#".to_string())), 1);
        }
    }

    #[tokio::test]
    async fn disconnect_does_not_reconnect_by_itself() {
        let (manager, transport, _) = connected().await;
        manager
            .handle_event(TransportEvent::Disconnected {
                reason: "broker restart".to_string(),
            })
            .await;

        assert_eq!(manager.status().await.state, ConnectionState::Disconnected);
        assert_eq!(transport.count(&Call::Connect), 1);

        assert!(manager.publish("lamp/set", "on").await);
        assert_eq!(transport.count(&Call::Connect), 2);
    }

    #[tokio::test]
    async fn refused_connack_stays_disconnected() {
        let (manager, transport, _) = manager();
        manager.connect().await;
        manager
            .handle_event(TransportEvent::ConnAck(
                ConnectReturnCode::BadUserNamePassword,
            ))
            .await;

        let status = manager.status().await;
        assert!(!status.connected);
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(transport.count(&Call::Connect), 1);
    }

    #[tokio::test]
    async fn subscribe_keeps_intent_when_transmission_fails() {
        let (manager, transport, _) = manager();
        transport.fail_connect.store(true, Ordering::SeqCst);
        transport.fail_subscribe.store(true, Ordering::SeqCst);

        assert!(manager.subscribe("sensors/temp").await);
        assert!(manager
            .status()
            .await
            .subscribed_topics
            .contains("sensors/temp"));
    }

    #[tokio::test]
    async fn rejected_subscribe_leaves_registry_untouched() {
        let (manager, transport, _) = connected().await;
        assert!(manager.subscribe("kept").await);
        transport.reject_subscribe.store(true, Ordering::SeqCst);

        assert!(!manager.subscribe("bad/#/filter").await);
        assert!(!manager.subscribe("kept").await);

        let topics = manager.status().await.subscribed_topics;
        assert_eq!(topics, BTreeSet::from(["kept".to_string()]));
    }

    #[tokio::test]
    async fn unsubscribe_forgets_topic_even_if_send_fails() {
        let (manager, transport, _) = connected().await;
        manager.subscribe("a").await;
        transport.fail_unsubscribe.store(true, Ordering::SeqCst);

        assert!(manager.unsubscribe("a").await);
        assert!(manager.status().await.subscribed_topics.is_empty());
    }

    #[tokio::test]
    async fn rejected_unsubscribe_keeps_topic() {
        let (manager, transport, _) = connected().await;
        manager.subscribe("a").await;
        transport.reject_unsubscribe.store(true, Ordering::SeqCst);

        assert!(!manager.unsubscribe("a").await);
        assert!(manager.status().await.subscribed_topics.contains("a"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_subscribes_lose_no_update() {
        let (manager, _, _) = connected().await;

        let first = tokio::spawn({
            let manager = manager.clone();
            async move { manager.subscribe("a").await }
        });
        let second = tokio::spawn({
            let manager = manager.clone();
            async move { manager.subscribe("b").await }
        });
        assert!(first.await.unwrap());
        assert!(second.await.unwrap());

        assert_eq!(
            manager.status().await.subscribed_topics,
            BTreeSet::from(["a".to_string(), "b".to_string()])
        );
    }

    #[tokio::test]
    async fn inbound_message_is_recorded_once() {
        let (manager, _, recorder) = connected().await;

        manager
            .handle_event(TransportEvent::Message {
                topic: "sensors/temp".to_string(),
                payload: b"23.5".to_vec(),
            })
            .await;

        let records = recorder.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].topic, "sensors/temp");
        assert_eq!(records[0].payload, "23.5");
        assert_eq!(records[0].direction, Direction::Received);
        assert_eq!(manager.status().await.messages_received, 1);
    }

    #[tokio::test]
    async fn undecodable_message_is_dropped_and_processing_continues() {
        let (manager, _, recorder) = connected().await;

        manager
            .handle_event(TransportEvent::Message {
                topic: "sensors/raw".to_string(),
                payload: vec![0xff, 0xfe, 0x00],
            })
            .await;
        assert!(recorder.records().is_empty());

        manager
            .handle_event(TransportEvent::Message {
                topic: "sensors/temp".to_string(),
                payload: b"21.0".to_vec(),
            })
            .await;
        assert_eq!(recorder.records().len(), 1);
        assert!(manager.publish("lamp/set", "on").await);
    }

    #[tokio::test]
    async fn store_failure_on_inbound_message_is_swallowed() {
        let (manager, _, recorder) = connected().await;
        recorder.fail.store(true, Ordering::SeqCst);

        manager
            .handle_event(TransportEvent::Message {
                topic: "sensors/temp".to_string(),
                payload: b"23.5".to_vec(),
            })
            .await;

        assert!(recorder.records().is_empty());
        assert_eq!(manager.status().await.messages_received, 1);
    }

    #[tokio::test]
    async fn event_loop_drives_state_from_channel() {
        let (event_tx, event_rx) = mpsc::channel(16);
        let transport = Arc::new(ScriptedTransport::with_events(event_tx.clone()));
        let recorder = Arc::new(MemoryRecorder::new());
        let manager = ConnectionManager::spawn(transport.clone(), recorder.clone(), event_rx);

        manager.subscribe("sensors/#").await;
        wait_until(|| {
            let manager = manager.clone();
            async move { manager.status().await.connected }
        })
        .await;

        event_tx
            .send(TransportEvent::Message {
                topic: "sensors/temp".to_string(),
                payload: b"23.5".to_vec(),
            })
            .await
            .unwrap();
        wait_until(|| {
            let recorder = recorder.clone();
            async move { recorder.records().len() == 1 }
        })
        .await;

        manager.close().await;
        let status = manager.status().await;
        assert!(!status.connected);
        assert!(status.subscribed_topics.contains("sensors/#"));
        assert_eq!(transport.count(&Call::Disconnect), 1);
    }

    #[tokio::test]
    async fn closed_manager_opens_no_new_session() {
        let (event_tx, event_rx) = mpsc::channel(16);
        let transport = Arc::new(ScriptedTransport::with_events(event_tx));
        let recorder = Arc::new(MemoryRecorder::new());
        let manager = ConnectionManager::spawn(transport.clone(), recorder.clone(), event_rx);

        manager.connect().await;
        wait_until(|| {
            let manager = manager.clone();
            async move { manager.status().await.connected }
        })
        .await;
        manager.close().await;

        assert!(!manager.publish("lamp/set", "on").await);
        assert!(!manager.subscribe("sensors/#").await);
        manager.connect().await;

        let status = manager.status().await;
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(status.subscribed_topics.is_empty());
        assert_eq!(transport.count(&Call::Connect), 1);
        assert_eq!(transport.count(&Call::Disconnect), 1);
        assert!(recorder.records().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn unsubscribe_racing_reconnect_leaves_wire_in_step_with_registry() {
        for _ in 0..50 {
            let (manager, transport, _) = connected().await;
            manager.subscribe("a").await;
            manager
                .handle_event(TransportEvent::Disconnected {
                    reason: "network down".to_string(),
                })
                .await;
            transport.clear_calls();

            let reconnect = tokio::spawn({
                let manager = manager.clone();
                async move {
                    manager
                        .handle_event(TransportEvent::ConnAck(ConnectReturnCode::Success))
                        .await
                }
            });
            let unsubscribe = tokio::spawn({
                let manager = manager.clone();
                async move { manager.unsubscribe("a").await }
            });
            reconnect.await.unwrap();
            assert!(unsubscribe.await.unwrap());

            assert!(manager.status().await.subscribed_topics.is_empty());
            let last_for_a = transport
                .calls()
                .into_iter()
                .filter(|c| {
                    matches!(c, Call::Subscribe(t) | Call::Unsubscribe(t) if t == "a")
                })
                .last();
            assert_eq!(last_for_a, Some(Call::Unsubscribe("a".to_string())));
        }
    }
}
