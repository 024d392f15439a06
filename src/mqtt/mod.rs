//! # MQTT Integration Module
//!
//! Owns the relay's single outbound connection to the MQTT broker. Every user session
//! shares it: subscriptions and publishes from all users travel over the same client,
//! and every message the broker delivers comes back through one event stream.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker URL parsing and credentials
//! ├── connection.rs       - Connection manager: singleton state, generations, status
//! ├── message_manager.rs  - Inbound message representation and the event sink
//! ├── mqtt_handler.rs     - rumqttc transport with acknowledgment tracking
//! └── transport.rs        - Transport traits the manager is written against
//! ```
//!
//! ## Connection Policy
//!
//! - At most one live connection per process; `connect` while connected is rejected
//! - No automatic reconnection. A dropped connection is reported and stays down until
//!   the next explicit `connect`
//! - Subscribe and unsubscribe resolve on the broker's acknowledgment, never earlier
//! - Publishing is QoS 0 fire-and-forget
//!
//! ## Event Flow
//!
//! ```text
//! rumqttc EventLoop ──► drive_event_loop ──[ConnectionEvent]──► Relay pump ──► Fan-out
//!                        (per connection)   (generation tagged)
//! ```

pub mod config;
pub mod connection;
pub mod message_manager;
pub mod mqtt_handler;
pub mod transport;

pub use config::{BrokerEndpoint, Credentials};
pub use connection::{
    Connected, ConnectionManager, ConnectionSettings, ConnectionState, Disconnected, MQTTStatus,
};
pub use message_manager::{ConnectionEvent, EventSink, MQTTMessage, TransportEvent};
pub use mqtt_handler::RumqttFactory;
pub use transport::{MqttTransport, TransportError, TransportFactory, TransportSettings};
