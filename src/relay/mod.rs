//! # Relay Service
//!
//! Owns every component of the relay and wires them together. The host process holds
//! one `Arc<Relay>` and feeds it from two sides:
//!
//! ```text
//! chat transport ──[user, text]──► Relay::submit ──► Dispatcher ──► Notifier (response)
//!
//! broker ──[ConnectionEvent]──► Relay::run_pump ──► FanOut ──► Notifier (per subscriber)
//! ```
//!
//! Connection events are consumed by a single pump task. Messages are only fanned out
//! while the connection that produced them is still the current one; a closed
//! connection drops the whole subscription index of its generation.

mod inbox;

pub use inbox::Inbox;

use crate::config::RelayConfig;
use crate::delivery::{DeliveryReport, FanOut, Notifier};
use crate::dispatch::{DirectiveParser, Dispatcher};
use crate::error::RelayError;
use crate::mqtt::{
    ConnectionEvent, ConnectionManager, ConnectionSettings, TransportEvent, TransportFactory,
};
use crate::registry::SubscriptionRegistry;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct Relay {
    connection: Arc<ConnectionManager>,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Arc<Dispatcher>,
    fanout: FanOut,
    notifier: Arc<dyn Notifier>,
    shutdown: CancellationToken,
}

impl Relay {
    /// Builds the relay and hands back the receiving end of its connection events
    ///
    /// The caller is expected to drive the receiver with [`Relay::run_pump`].
    pub fn new(
        config: &RelayConfig,
        factory: Arc<dyn TransportFactory>,
        notifier: Arc<dyn Notifier>,
    ) -> (Arc<Self>, mpsc::Receiver<ConnectionEvent>) {
        let (events_tx, events_rx) = mpsc::channel(config.event_channel_capacity);

        let connection = Arc::new(ConnectionManager::new(
            factory,
            ConnectionSettings::from(config),
            events_tx,
        ));
        let registry = Arc::new(SubscriptionRegistry::new(connection.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            DirectiveParser::new(config.command_prefix.clone()),
            connection.clone(),
            registry.clone(),
        ));
        let fanout = FanOut::new(registry.clone(), notifier.clone());

        let relay = Arc::new(Self {
            connection,
            registry,
            dispatcher,
            fanout,
            notifier,
            shutdown: CancellationToken::new(),
        });
        (relay, events_rx)
    }

    /// Builds the relay and spawns its message pump
    pub fn spawn(
        config: &RelayConfig,
        factory: Arc<dyn TransportFactory>,
        notifier: Arc<dyn Notifier>,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (relay, events) = Self::new(config, factory, notifier);
        let pump = tokio::spawn(relay.clone().run_pump(events));
        (relay, pump)
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Runs one directive and returns its response
    ///
    /// Returns `None` when the text is not addressed to the relay. A panic while
    /// handling the directive is reported as an internal error instead of taking the
    /// caller down with it.
    pub async fn handle_directive(&self, user: &str, input: &str) -> Option<String> {
        let dispatcher = self.dispatcher.clone();
        let owned_user = user.to_string();
        let owned_input = input.to_string();
        let handled =
            tokio::spawn(async move { dispatcher.handle(&owned_user, &owned_input).await }).await;

        match handled {
            Ok(response) => response,
            Err(e) => {
                error!("Directive from {} aborted: {}", user, e);
                Some(format!("Error: {}", RelayError::Internal(e.to_string())))
            }
        }
    }

    /// Runs one directive and sends the response back to `user`
    ///
    /// Returns false if the text was ignored or the response could not be delivered.
    pub async fn submit(&self, user: &str, input: &str) -> bool {
        let Some(response) = self.handle_directive(user, input).await else {
            debug!("Ignoring text from {} without command prefix", user);
            return false;
        };
        match self.notifier.notify(user, &response).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Response to {} was not delivered: {}", user, e);
                false
            }
        }
    }

    /// Applies one connection event
    ///
    /// Returns the delivery report if the event was a message that got fanned out.
    pub async fn handle_event(&self, event: ConnectionEvent) -> Option<DeliveryReport> {
        let ConnectionEvent { generation, event } = event;
        match event {
            TransportEvent::Message(message) => {
                if !self.connection.is_current(generation) {
                    debug!(
                        "Dropping message on {} from stale connection {}",
                        message.topic(),
                        generation
                    );
                    return None;
                }
                self.connection.note_received().await;
                Some(self.fanout.deliver(&message).await)
            }
            TransportEvent::Error(message) => {
                self.connection.record_error(generation, &message).await;
                None
            }
            TransportEvent::Closed => {
                if self.connection.mark_lost(generation).await {
                    let dropped = self.registry.clear_all(generation).await;
                    warn!(
                        "Broker connection closed, {} subscription(s) dropped",
                        dropped
                    );
                }
                None
            }
        }
    }

    /// Consumes connection events until the relay shuts down
    pub async fn run_pump(self: Arc<Self>, mut events: mpsc::Receiver<ConnectionEvent>) {
        info!("Message pump started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Message pump stopped");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => {
                        self.handle_event(event).await;
                    }
                    None => {
                        debug!("Connection event channel closed");
                        break;
                    }
                },
            }
        }
    }

    /// Closes the broker connection if there is one and stops the pump
    pub async fn shutdown(&self) {
        if self.connection.is_connected().await {
            match self.connection.disconnect().await {
                Ok(disconnected) => {
                    let dropped = self.registry.clear_all(disconnected.generation).await;
                    info!(
                        "Disconnected from {} on shutdown, {} subscription(s) dropped",
                        disconnected.broker_url, dropped
                    );
                }
                Err(e) => debug!("Nothing to disconnect on shutdown: {}", e),
            }
        }
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
