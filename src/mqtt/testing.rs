//! Test doubles for the transport seam and the message recorder.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use rumqttc::ConnectReturnCode;
use tokio::sync::mpsc;

use super::error::{StoreError, TransportError};
use super::message_manager::{MessageRecord, MessageRecorder};
use super::transport::{Transport, TransportEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect,
    Publish { topic: String, payload: String },
    Subscribe(String),
    Unsubscribe(String),
    Disconnect,
}

/// Transport that records every call and fails on request.
///
/// With an event sender attached, a successful `connect` emits a CONNACK the
/// way the real adapter does.
#[derive(Default)]
pub struct ScriptedTransport {
    calls: StdMutex<Vec<Call>>,
    events: Option<mpsc::Sender<TransportEvent>>,
    pub fail_connect: AtomicBool,
    pub fail_publish: AtomicBool,
    pub fail_subscribe: AtomicBool,
    pub reject_subscribe: AtomicBool,
    pub fail_unsubscribe: AtomicBool,
    pub reject_unsubscribe: AtomicBool,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(events: mpsc::Sender<TransportEvent>) -> Self {
        Self {
            events: Some(events),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn count(&self, wanted: &Call) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == wanted).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.record(Call::Connect);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectFailed {
                addr: "test:1883".to_string(),
                reason: "connection refused".to_string(),
            });
        }
        if let Some(events) = &self.events {
            let _ = events
                .send(TransportEvent::ConnAck(ConnectReturnCode::Success))
                .await;
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), TransportError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::Request("queue full".to_string()));
        }
        self.record(Call::Publish {
            topic: topic.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        if self.reject_subscribe.load(Ordering::SeqCst) {
            return Err(TransportError::InvalidTopic(filter.to_string()));
        }
        self.record(Call::Subscribe(filter.to_string()));
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        if self.reject_unsubscribe.load(Ordering::SeqCst) {
            return Err(TransportError::InvalidTopic(filter.to_string()));
        }
        self.record(Call::Unsubscribe(filter.to_string()));
        if self.fail_unsubscribe.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.record(Call::Disconnect);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryRecorder {
    records: StdMutex<Vec<MessageRecord>>,
    pub fail: AtomicBool,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<MessageRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageRecorder for MemoryRecorder {
    async fn append(&self, record: MessageRecord) -> Result<(), StoreError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store offline".to_string()));
        }
        self.records.lock().unwrap().push(record);
        Ok(())
    }
}
