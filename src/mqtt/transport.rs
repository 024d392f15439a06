//! Seam between the connection manager and the MQTT client library
//!
//! The relay only needs five primitives from the wire protocol layer: open a
//! connection, publish, subscribe, unsubscribe and close. Every call that the
//! broker acknowledges (connect, subscribe, unsubscribe) resolves only after the
//! acknowledgment arrived, so callers can commit state on confirmed success.
//!
//! Asynchronous broker events (messages, errors, close) are not callbacks. The
//! transport pushes them through the [`EventSink`] it was opened with.

use super::config::BrokerEndpoint;
use super::message_manager::EventSink;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Failures reported by the MQTT layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("broker refused the connection: {0}")]
    Refused(String),

    #[error("no connection acknowledgment within {0:?}")]
    Timeout(Duration),

    #[error("broker rejected the subscription to {0}")]
    SubscriptionRejected(String),

    #[error("client request failed: {0}")]
    Request(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("connection closed")]
    Closed,
}

/// Per-connection parameters handed to the transport
#[derive(Clone, Debug)]
pub struct TransportSettings {
    pub client_id: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub request_capacity: usize,
}

/// A live broker connection
#[async_trait]
pub trait MqttTransport: Send + Sync {
    /// Queues a QoS 0 publish; there is no delivery confirmation
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Resolves once the broker acknowledged the subscription
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Resolves once the broker acknowledged the unsubscription
    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Drops the connection without waiting for in-flight acknowledgments
    async fn close(&self);
}

/// Opens [`MqttTransport`]s
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Connects to `endpoint` and resolves after the broker accepted the session.
    /// Automatic reconnection must be disabled on the returned transport.
    async fn open(
        &self,
        endpoint: &BrokerEndpoint,
        settings: TransportSettings,
        events: EventSink,
    ) -> Result<Box<dyn MqttTransport>, TransportError>;
}
