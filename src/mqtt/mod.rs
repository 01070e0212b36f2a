//! # MQTT Integration Module
//!
//! Client side of the broker connection. One [`ConnectionManager`] per process
//! owns the transport session, remembers which topic filters should be
//! subscribed, and logs every message that goes out or comes in through a
//! [`MessageRecorder`].
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker address, credentials, keep-alive, QoS
//! ├── error.rs            - Transport, store and manager error types
//! ├── message_manager.rs  - Payloads, message records and the recorder seam
//! ├── subscriptions.rs    - Subscription intent and topic/filter validation
//! ├── transport.rs        - Transport seam and the rumqttc adapter
//! └── mqtt_handler.rs     - Connection state machine and public API
//! ```
//!
//! ## Event Flow
//!
//! ```text
//! console / callers ──publish/subscribe──► ConnectionManager ──► Transport ──► broker
//!                                               ▲                    │
//!                                               └── TransportEvent ◄─┘
//!                                                  (mpsc, own task)
//! ```
//!
//! The transport's pump task never touches manager state directly. It only
//! forwards CONNACK, PUBLISH and disconnects over a channel; the manager's event
//! loop applies them under the same lock the public API uses.
//!
//! ## Reconnection Policy
//!
//! Reconnection is reactive. A dropped session stays `Disconnected` until the
//! next `publish` or `subscribe` call, which makes one connect attempt before
//! doing its own work. Every successful CONNACK re-issues a subscribe request
//! for each registered filter.
//!
//! A `subscribe` that triggers the connect sends its own SUBSCRIBE. When the
//! CONNACK is handled after the filter was registered, the resubscribe pass
//! sends it a second time on the same session. Brokers treat a repeated
//! SUBSCRIBE as a replacement, so this costs one extra packet.
//!
//! Subscribe and unsubscribe requests, including the resubscribe pass, are
//! issued while the manager's state lock is held. The wire order of requests
//! for one filter therefore matches the order of registry changes. The state
//! lock is never held across `Transport::connect`.
//!
//! After `close()` no new session is opened; `connect`, `publish` and
//! `subscribe` fail without touching the transport.

pub mod config;
pub mod error;
pub mod message_manager;
pub mod mqtt_handler;
pub mod subscriptions;
#[cfg(test)]
pub mod testing;
pub mod transport;

pub use config::MqttConfig;
pub use error::{MqttError, StoreError, TransportError};
pub use message_manager::{Direction, MessageRecord, MessageRecorder, Payload};
pub use mqtt_handler::{ConnectionManager, ConnectionState, MqttStatus};
pub use transport::{RumqttTransport, Transport, TransportEvent};
