use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sent,
    Received,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Direction::Sent => write!(f, "sent"),
            Direction::Received => write!(f, "received"),
        }
    }
}

/// Outbound payload as handed to `publish`.
///
/// Text goes out byte for byte, even when it is not valid JSON. Structured
/// values are serialized to a JSON string first.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Json(serde_json::Value),
}

impl Payload {
    /// Renders the text that goes on the wire and into the message log.
    pub fn into_wire(self) -> Result<String, serde_json::Error> {
        match self {
            Payload::Text(text) => Ok(text),
            Payload::Json(value) => serde_json::to_string(&value),
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Json(value)
    }
}

/// Immutable log entry for one message that crossed the broker connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub topic: String,
    pub payload: String,
    pub direction: Direction,
    pub occurred_at: DateTime<Local>,
}

impl MessageRecord {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>, direction: Direction) -> Self {
        MessageRecord {
            topic: topic.into(),
            payload: payload.into(),
            direction,
            occurred_at: Local::now(),
        }
    }

    pub fn sent(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::new(topic, payload, Direction::Sent)
    }

    pub fn received(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::new(topic, payload, Direction::Received)
    }
}

impl fmt::Display for MessageRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = self.payload.chars().take(32).collect();
        let ellipsis = if self.payload.chars().count() > 32 { "..." } else { "" };
        write!(
            f,
            "{} {} {} - {}{}",
            self.occurred_at.format("%Y-%m-%d %H:%M:%S"),
            self.direction,
            self.topic,
            preview,
            ellipsis
        )
    }
}

/// Append-only sink for message records.
///
/// The connection manager calls this outside of its state lock and only logs
/// failures, so implementations are free to do storage I/O.
#[async_trait]
pub trait MessageRecorder: Send + Sync {
    async fn append(&self, record: MessageRecord) -> Result<(), StoreError>;
}
