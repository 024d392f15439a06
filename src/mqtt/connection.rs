//! Singleton broker connection shared by every user session
//!
//! The manager owns at most one live [`MqttTransport`]. Each successful `connect`
//! and each teardown bumps a generation counter; acknowledgment-driven registry
//! commits and inbound messages compare against it, so nothing produced by a dead
//! connection can leak into the current one.

use super::config::{has_known_scheme, BrokerEndpoint, Credentials, MQTTS_SCHEME, MQTT_SCHEME};
use super::message_manager::{ConnectionEvent, EventSink};
use super::transport::{MqttTransport, TransportFactory, TransportSettings};
use crate::config::RelayConfig;
use crate::error::RelayError;
use chrono::{DateTime, Local};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

const MAX_ERROR_MESSAGES: usize = 10;

#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// The broker connection dropped or could not be established
    Failed,
}

#[derive(Clone, Debug, Default)]
pub struct MQTTStatus {
    pub connection_state: ConnectionState,
    pub broker_url: String,
    pub client_id: String,
    pub error_messages: Vec<String>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<DateTime<Local>>,
}

impl MQTTStatus {
    pub fn connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }

    pub fn last_error(&self) -> Option<&str> {
        self.error_messages.last().map(String::as_str)
    }

    fn push_error(&mut self, message: String) {
        if self.error_messages.len() == MAX_ERROR_MESSAGES {
            self.error_messages.remove(0);
        }
        self.error_messages.push(message);
    }
}

/// Result of a successful [`ConnectionManager::connect`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Connected {
    pub generation: u64,
    pub broker_url: String,
    pub client_id: String,
}

/// Result of a successful [`ConnectionManager::disconnect`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Disconnected {
    /// Generation of the connection that was torn down
    pub generation: u64,
    pub broker_url: String,
}

/// Static parameters for every connection the manager opens
#[derive(Clone, Debug)]
pub struct ConnectionSettings {
    pub client_id_prefix: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub request_capacity: usize,
}

impl From<&RelayConfig> for ConnectionSettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            client_id_prefix: config.client_id_prefix.clone(),
            keep_alive: config.keep_alive(),
            connect_timeout: config.connect_timeout(),
            request_capacity: config.request_channel_capacity,
        }
    }
}

#[derive(Default)]
struct ConnectionSlot {
    status: MQTTStatus,
    transport: Option<Arc<dyn MqttTransport>>,
}

pub struct ConnectionManager {
    factory: Arc<dyn TransportFactory>,
    settings: ConnectionSettings,
    events: mpsc::Sender<ConnectionEvent>,
    slot: RwLock<ConnectionSlot>,
    generation: AtomicU64,
    // Serializes connect and disconnect
    lifecycle: Mutex<()>,
}

impl ConnectionManager {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        settings: ConnectionSettings,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> Self {
        Self {
            factory,
            settings,
            events,
            slot: RwLock::new(ConnectionSlot::default()),
            generation: AtomicU64::new(0),
            lifecycle: Mutex::new(()),
        }
    }

    /// Opens the broker connection, replacing any stale handle
    ///
    /// # Errors
    ///
    /// * [`RelayError::AlreadyConnected`] - a live connection exists
    /// * [`RelayError::InvalidUrl`] - unknown scheme or unusable host/port
    /// * [`RelayError::Transport`] - the broker refused or did not answer in time
    pub async fn connect(
        &self,
        url: &str,
        credentials: Option<Credentials>,
    ) -> Result<Connected, RelayError> {
        if !has_known_scheme(url) {
            return Err(RelayError::InvalidUrl(format!(
                "`{}` must start with {} or {}",
                url, MQTT_SCHEME, MQTTS_SCHEME
            )));
        }
        let endpoint = BrokerEndpoint::parse(url)?.with_credentials(credentials);

        let _lifecycle = self.lifecycle.lock().await;

        let stale = {
            let mut slot = self.slot.write().await;
            if slot.status.connected() && slot.transport.is_some() {
                return Err(RelayError::AlreadyConnected(slot.status.broker_url.clone()));
            }
            slot.status.connection_state = ConnectionState::Connecting;
            slot.status.broker_url = endpoint.display_url();
            slot.transport.take()
        };
        if let Some(stale) = stale {
            info!("Tearing down stale broker connection before reconnecting");
            stale.close().await;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let client_id = self.next_client_id();
        let settings = TransportSettings {
            client_id: client_id.clone(),
            keep_alive: self.settings.keep_alive,
            connect_timeout: self.settings.connect_timeout,
            request_capacity: self.settings.request_capacity,
        };
        info!(
            "Connecting to {} as {} (generation {})",
            endpoint, client_id, generation
        );

        let opened = self
            .factory
            .open(&endpoint, settings, EventSink::new(generation, self.events.clone()))
            .await;

        let mut slot = self.slot.write().await;
        match opened {
            Ok(transport) => {
                slot.transport = Some(Arc::from(transport));
                slot.status.connection_state = ConnectionState::Connected;
                slot.status.client_id = client_id.clone();
                slot.status.messages_received = 0;
                slot.status.messages_sent = 0;
                slot.status.last_activity = Some(Local::now());
                info!("Connected to {}", endpoint);
                Ok(Connected {
                    generation,
                    broker_url: endpoint.display_url(),
                    client_id,
                })
            }
            Err(e) => {
                error!("Connecting to {} failed: {}", endpoint, e);
                slot.status.connection_state = ConnectionState::Failed;
                slot.status.broker_url.clear();
                slot.status.push_error(e.to_string());
                Err(RelayError::Transport(e))
            }
        }
    }

    /// Closes the live connection without waiting for in-flight acknowledgments
    ///
    /// The caller is responsible for clearing the subscription index of the returned
    /// generation.
    pub async fn disconnect(&self) -> Result<Disconnected, RelayError> {
        let _lifecycle = self.lifecycle.lock().await;

        let (transport, disconnected) = {
            let mut slot = self.slot.write().await;
            let Some(transport) = slot.transport.take() else {
                return Err(RelayError::NotConnected);
            };
            let generation = self.generation.fetch_add(1, Ordering::SeqCst);
            slot.status.connection_state = ConnectionState::Disconnected;
            let broker_url = std::mem::take(&mut slot.status.broker_url);
            (
                transport,
                Disconnected {
                    generation,
                    broker_url,
                },
            )
        };

        transport.close().await;
        info!("Disconnected from {}", disconnected.broker_url);
        Ok(disconnected)
    }

    /// QoS 0 publish; failures are logged and reported, never retried
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), RelayError> {
        let (_, transport) = self.live_transport().await.ok_or(RelayError::NotConnected)?;
        let size = payload.len();

        match transport.publish(topic, payload).await {
            Ok(()) => {
                debug!("Published {} bytes to {}", size, topic);
                let mut slot = self.slot.write().await;
                slot.status.messages_sent += 1;
                slot.status.last_activity = Some(Local::now());
                Ok(())
            }
            Err(e) => {
                warn!("Publishing to {} failed: {}", topic, e);
                Err(RelayError::Transport(e))
            }
        }
    }

    pub async fn status(&self) -> MQTTStatus {
        self.slot.read().await.status.clone()
    }

    pub async fn is_connected(&self) -> bool {
        let slot = self.slot.read().await;
        slot.status.connected() && slot.transport.is_some()
    }

    /// Current transport together with the generation it belongs to
    pub async fn live_transport(&self) -> Option<(u64, Arc<dyn MqttTransport>)> {
        let slot = self.slot.read().await;
        if !slot.status.connected() {
            return None;
        }
        let transport = slot.transport.clone()?;
        Some((self.generation.load(Ordering::SeqCst), transport))
    }

    /// True while no connect or teardown happened since `generation` was observed
    pub fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    pub async fn note_received(&self) {
        let mut slot = self.slot.write().await;
        slot.status.messages_received += 1;
        slot.status.last_activity = Some(Local::now());
    }

    /// Records a connection-level error; no reconnect is attempted
    pub async fn record_error(&self, generation: u64, message: &str) {
        if !self.is_current(generation) {
            debug!(
                "Ignoring error from stale connection {}: {}",
                generation, message
            );
            return;
        }
        warn!("Broker connection error: {}", message);
        self.slot.write().await.status.push_error(message.to_string());
    }

    /// Marks the connection of `generation` as lost and drops its handle
    ///
    /// Returns true if it was the current connection, meaning the subscription
    /// index no longer reflects anything the broker knows about.
    pub async fn mark_lost(&self, generation: u64) -> bool {
        let transport = {
            let mut slot = self.slot.write().await;
            if !self.is_current(generation) || slot.transport.is_none() {
                debug!("Close of stale connection {} ignored", generation);
                return false;
            }
            self.generation.fetch_add(1, Ordering::SeqCst);
            slot.status.connection_state = ConnectionState::Failed;
            slot.status.broker_url.clear();
            slot.transport.take()
        };

        warn!("Broker connection {} lost", generation);
        if let Some(transport) = transport {
            transport.close().await;
        }
        true
    }

    fn next_client_id(&self) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("{}_{}", self.settings.client_id_prefix, &id[..8])
    }
}

#[cfg(test)]
impl ConnectionManager {
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}
