use std::time::Duration;

use rumqttc::QoS;
use serde::{Deserialize, Serialize};

/// Broker connection settings, fixed for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Keep-alive interval handed to the broker in the CONNECT packet
    pub keep_alive_secs: u64,
    /// Upper bound for the socket connect + CONNACK round trip
    pub connect_timeout_secs: u64,
    /// Capacity of the request queue between client handle and event loop
    pub request_capacity: usize,
    /// Delivery level used for publish and subscribe requests (0, 1 or 2)
    pub qos: u8,
    /// Topic filters subscribed at startup
    pub subscriptions: Vec<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: format!("mqtt-commander-{}", std::process::id()),
            username: None,
            password: None,
            keep_alive_secs: 60,
            connect_timeout_secs: 5,
            request_capacity: 100,
            qos: 1,
            subscriptions: Vec::new(),
        }
    }
}

impl MqttConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Maps the numeric level onto rumqttc's QoS, falling back to at-least-once.
    pub fn qos(&self) -> QoS {
        match self.qos {
            0 => QoS::AtMostOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtLeastOnce,
        }
    }

    /// Credentials are only sent when a non-empty username is configured.
    pub fn credentials(&self) -> Option<(String, String)> {
        match self.username.as_deref() {
            Some(user) if !user.is_empty() => Some((
                user.to_string(),
                self.password.clone().unwrap_or_default(),
            )),
            _ => None,
        }
    }

    pub fn broker_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
