//! Narrow seam over the MQTT protocol client.
//!
//! A [`Transport`] only hands requests over for transmission; success means
//! "queued", never "acknowledged by the broker". Lifecycle notifications travel
//! the other way as [`TransportEvent`]s on an mpsc channel that the connection
//! manager drains in its own task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet,
};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::MqttConfig;
use super::error::TransportError;
use super::subscriptions::{valid_filter, valid_topic};

/// Time the pump gets to flush a DISCONNECT before it is cancelled
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Asynchronous notifications raised by the transport, one per occurrence.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    ConnAck(ConnectReturnCode),
    Message { topic: String, payload: Vec<u8> },
    Disconnected { reason: String },
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a session. Returns once the broker accepted or refused it.
    async fn connect(&self) -> Result<(), TransportError>;

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), TransportError>;

    async fn subscribe(&self, filter: &str) -> Result<(), TransportError>;

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError>;

    /// Sends DISCONNECT if a session is live and stops its background I/O.
    async fn disconnect(&self) -> Result<(), TransportError>;
}

struct Session {
    id: u64,
    client: AsyncClient,
    cancel: CancellationToken,
    pump: Option<JoinHandle<()>>,
}

/// [`Transport`] backed by rumqttc's `AsyncClient` and `EventLoop`.
///
/// Each successful `connect` starts one pump task that polls the event loop.
/// The pump stops at the first connection error and reports it as a single
/// `Disconnected` event; it never reconnects on its own.
pub struct RumqttTransport {
    config: MqttConfig,
    events: mpsc::Sender<TransportEvent>,
    session: Arc<Mutex<Option<Session>>>,
    next_session: AtomicU64,
}

impl RumqttTransport {
    pub fn new(config: MqttConfig, events: mpsc::Sender<TransportEvent>) -> Self {
        Self {
            config,
            events,
            session: Arc::new(Mutex::new(None)),
            next_session: AtomicU64::new(0),
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(
            self.config.client_id.clone(),
            self.config.host.clone(),
            self.config.port,
        );
        options.set_keep_alive(self.config.keep_alive());
        if let Some((user, password)) = self.config.credentials() {
            options.set_credentials(user, password);
        }
        options
    }

    async fn client(&self) -> Result<AsyncClient, TransportError> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| session.client.clone())
            .ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl Transport for RumqttTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let addr = self.config.broker_addr();
        let (client, mut eventloop) =
            AsyncClient::new(self.options(), self.config.request_capacity);

        info!("Connecting to MQTT broker at {}", addr);
        let first = timeout(self.config.connect_timeout(), eventloop.poll())
            .await
            .map_err(|_| TransportError::ConnectFailed {
                addr: addr.clone(),
                reason: format!(
                    "no CONNACK within {}s",
                    self.config.connect_timeout_secs
                ),
            })?;

        let code = match first {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => ack.code,
            Ok(event) => {
                debug!("First event after connect was {:?}", event);
                ConnectReturnCode::Success
            }
            Err(ConnectionError::ConnectionRefused(code)) => {
                return Err(TransportError::Refused(code))
            }
            Err(e) => {
                return Err(TransportError::ConnectFailed {
                    addr,
                    reason: e.to_string(),
                })
            }
        };
        if code != ConnectReturnCode::Success {
            return Err(TransportError::Refused(code));
        }

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        {
            let mut session = self.session.lock().await;
            if let Some(stale) = session.take() {
                debug!("Replacing stale MQTT session {}", stale.id);
                stale.cancel.cancel();
            }
            *session = Some(Session {
                id,
                client,
                cancel: cancel.clone(),
                pump: None,
            });
        }

        if self.events.send(TransportEvent::ConnAck(code)).await.is_err() {
            warn!("Transport event receiver dropped before CONNACK could be delivered");
        }

        let pump = tokio::spawn(pump_events(
            id,
            eventloop,
            self.events.clone(),
            self.session.clone(),
            cancel,
        ));
        if let Some(session) = self.session.lock().await.as_mut() {
            if session.id == id {
                session.pump = Some(pump);
            }
        }

        info!("MQTT session {} established with {}", id, addr);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), TransportError> {
        if !valid_topic(topic) {
            return Err(TransportError::InvalidTopic(topic.to_string()));
        }
        let client = self.client().await?;
        client.try_publish(topic, self.config.qos(), false, payload.as_bytes().to_vec())?;
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        if !valid_filter(filter) {
            return Err(TransportError::InvalidTopic(filter.to_string()));
        }
        let client = self.client().await?;
        client.try_subscribe(filter, self.config.qos())?;
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        if !valid_filter(filter) {
            return Err(TransportError::InvalidTopic(filter.to_string()));
        }
        let client = self.client().await?;
        client.try_unsubscribe(filter)?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };

        info!("Closing MQTT session {}", session.id);
        let result = session.client.try_disconnect().map_err(TransportError::from);
        match session.pump {
            Some(mut pump) => {
                if timeout(DISCONNECT_GRACE, &mut pump).await.is_err() {
                    debug!("MQTT pump did not stop in time, cancelling");
                    session.cancel.cancel();
                }
            }
            None => session.cancel.cancel(),
        }
        result
    }
}

async fn pump_events(
    id: u64,
    mut eventloop: EventLoop,
    events: mpsc::Sender<TransportEvent>,
    session: Arc<Mutex<Option<Session>>>,
    cancel: CancellationToken,
) {
    debug!("MQTT pump for session {} started", id);

    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => break "session closed locally".to_string(),
            polled = eventloop.poll() => match polled {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let event = TransportEvent::Message {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    };
                    if events.send(event).await.is_err() {
                        break "event receiver dropped".to_string();
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if events.send(TransportEvent::ConnAck(ack.code)).await.is_err() {
                        break "event receiver dropped".to_string();
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    break "broker sent DISCONNECT".to_string()
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    break "client sent DISCONNECT".to_string()
                }
                Ok(event) => debug!("MQTT event: {:?}", event),
                Err(e) => break e.to_string(),
            }
        }
    };

    {
        let mut guard = session.lock().await;
        if guard.as_ref().is_some_and(|s| s.id == id) {
            *guard = None;
        }
    }

    warn!("MQTT session {} ended: {}", id, reason);
    if events
        .send(TransportEvent::Disconnected { reason })
        .await
        .is_err()
    {
        debug!("No receiver left for disconnect of session {}", id);
    }
}
