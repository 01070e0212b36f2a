//! Error types for the MQTT subsystem

use rumqttc::ConnectReturnCode;
use thiserror::Error;

/// Failures raised by a [`Transport`](super::transport::Transport) implementation
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket level failure or timeout while opening the session
    #[error("connection to {addr} failed: {reason}")]
    ConnectFailed { addr: String, reason: String },

    /// Broker answered the CONNECT with a non-success code
    #[error("broker refused connection: {0:?}")]
    Refused(ConnectReturnCode),

    /// No live session to hand the request to
    #[error("not connected to broker")]
    NotConnected,

    /// Topic or filter rejected before any request was issued
    #[error("invalid topic '{0}'")]
    InvalidTopic(String),

    /// Request could not be queued for transmission
    #[error("request failed: {0}")]
    Request(String),
}

impl TransportError {
    /// True when the request never reached the wire layer at all.
    pub fn is_rejection(&self) -> bool {
        matches!(self, TransportError::InvalidTopic(_))
    }
}

impl From<rumqttc::ClientError> for TransportError {
    fn from(e: rumqttc::ClientError) -> Self {
        TransportError::Request(e.to_string())
    }
}

/// Failures of a [`MessageRecorder`](super::message_manager::MessageRecorder)
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("message store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("message store encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("message store unavailable: {0}")]
    Unavailable(String),
}

/// Every failure the connection manager can observe.
///
/// None of these cross the manager's public API; they are logged and turned
/// into a `false` return value or an unchanged `Disconnected` state.
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("connect failed: {0}")]
    ConnectFailed(#[source] TransportError),

    #[error("publish to '{topic}' failed: {source}")]
    PublishFailed {
        topic: String,
        #[source]
        source: TransportError,
    },

    #[error("subscribe to '{topic}' failed: {source}")]
    SubscribeFailed {
        topic: String,
        #[source]
        source: TransportError,
    },

    #[error("unsubscribe from '{topic}' failed: {source}")]
    UnsubscribeFailed {
        topic: String,
        #[source]
        source: TransportError,
    },

    #[error("payload on '{topic}' is not valid UTF-8: {source}")]
    DecodeFailed {
        topic: String,
        #[source]
        source: std::string::FromUtf8Error,
    },

    #[error("recording message on '{topic}' failed: {source}")]
    StoreFailed {
        topic: String,
        #[source]
        source: StoreError,
    },

    #[error("connection manager is closed")]
    Closed,

    #[error("payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}
