use chrono::NaiveDateTime;
use std::fmt;
use tokio::sync::mpsc;
use tracing::debug;

/// A message delivered by the broker on one of the relay's subscriptions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MQTTMessage {
    topic: String,
    payload: Vec<u8>,
    timestamp: NaiveDateTime,
}

impl fmt::Display for MQTTMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} - {} ({} bytes)",
            self.timestamp,
            self.topic,
            self.payload.len()
        )
    }
}

impl MQTTMessage {
    pub fn from_topic(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        MQTTMessage {
            topic: topic.into(),
            payload: payload.into(),
            timestamp: chrono::Local::now().naive_local(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }

    /// Payload as text, invalid UTF-8 sequences replaced
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Notification text sent to each subscriber: `[<topic>]: <payload-text>`
    pub fn render(&self) -> String {
        format!("[{}]: {}", self.topic, self.payload_text())
    }
}

/// Asynchronous happenings on a broker connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(MQTTMessage),
    /// Connection-level error reported by the client library
    Error(String),
    /// The connection is gone and will not come back on its own
    Closed,
}

/// A [`TransportEvent`] tagged with the connection generation that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub generation: u64,
    pub event: TransportEvent,
}

/// Sending half handed to a transport when it is opened
///
/// Every event is stamped with the generation of the connection, so events from a
/// torn-down connection can be told apart from the current one.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::Sender<ConnectionEvent>,
}

impl EventSink {
    pub fn new(generation: u64, tx: mpsc::Sender<ConnectionEvent>) -> Self {
        Self { generation, tx }
    }

    /// Returns false once the receiving side is gone
    pub async fn emit(&self, event: TransportEvent) -> bool {
        let event = ConnectionEvent {
            generation: self.generation,
            event,
        };
        match self.tx.send(event).await {
            Ok(()) => true,
            Err(e) => {
                debug!(
                    "Event for connection {} dropped, receiver closed: {:?}",
                    self.generation, e.0.event
                );
                false
            }
        }
    }
}
