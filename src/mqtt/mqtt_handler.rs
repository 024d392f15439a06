//! rumqttc-backed [`MqttTransport`]
//!
//! A connection goes through three compile-time states before it is handed out:
//!
//! ```text
//! Configured ──open()──► Connecting ──await_connack()──► Established ──► RumqttTransport
//! ```
//!
//! The event loop runs in its own tokio task and is the only place that sees broker
//! packets. rumqttc reports the packet id of a SUBSCRIBE/UNSUBSCRIBE only after it
//! wrote the request (`Outgoing::Subscribe(pkid)`), in request order, so waiters are
//! queued under a gate in the same order the requests are handed to the client and
//! bound to their packet id when the outgoing event shows up.
//!
//! The event loop stops on the first error or broker DISCONNECT. rumqttc would
//! reconnect if polled again; the relay never does that.

use super::config::BrokerEndpoint;
use super::message_manager::{EventSink, MQTTMessage, TransportEvent};
use super::transport::{MqttTransport, TransportError, TransportFactory, TransportSettings};
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubAck,
    SubscribeReasonCode, Transport,
};
use statum::{machine, state};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type AckResult = Result<(), TransportError>;

struct Waiter {
    topic: String,
    tx: oneshot::Sender<AckResult>,
}

#[derive(Default)]
struct AckQueues {
    subscribe: VecDeque<Waiter>,
    unsubscribe: VecDeque<Waiter>,
    in_flight: HashMap<u16, Waiter>,
}

/// Matches SUBACK/UNSUBACK packets to the callers waiting for them
#[derive(Default)]
struct AckTracker {
    // Held while a waiter is queued and its request handed to the client
    gate: Mutex<()>,
    queues: Mutex<AckQueues>,
}

#[derive(Clone, Copy, Debug)]
enum AckKind {
    Subscribe,
    Unsubscribe,
}

impl AckTracker {
    async fn enqueue(&self, kind: AckKind, topic: &str) -> oneshot::Receiver<AckResult> {
        let (tx, rx) = oneshot::channel();
        let waiter = Waiter {
            topic: topic.to_string(),
            tx,
        };
        let mut queues = self.queues.lock().await;
        match kind {
            AckKind::Subscribe => queues.subscribe.push_back(waiter),
            AckKind::Unsubscribe => queues.unsubscribe.push_back(waiter),
        }
        rx
    }

    /// Removes the most recently queued waiter after the client refused the request
    async fn withdraw(&self, kind: AckKind) {
        let mut queues = self.queues.lock().await;
        match kind {
            AckKind::Subscribe => queues.subscribe.pop_back(),
            AckKind::Unsubscribe => queues.unsubscribe.pop_back(),
        };
    }

    async fn bind(&self, kind: AckKind, pkid: u16) {
        let mut queues = self.queues.lock().await;
        let waiter = match kind {
            AckKind::Subscribe => queues.subscribe.pop_front(),
            AckKind::Unsubscribe => queues.unsubscribe.pop_front(),
        };
        match waiter {
            Some(waiter) => {
                debug!("{:?} for {} sent with pkid {}", kind, waiter.topic, pkid);
                queues.in_flight.insert(pkid, waiter);
            }
            None => warn!("Outgoing {:?} pkid {} has no waiter", kind, pkid),
        }
    }

    /// Hands `result` to the waiter bound to `pkid`. A rejection is reported with
    /// the topic the waiter asked for.
    async fn resolve(&self, pkid: u16, result: AckResult) {
        let waiter = self.queues.lock().await.in_flight.remove(&pkid);
        match waiter {
            Some(waiter) => {
                let result = match result {
                    Err(TransportError::SubscriptionRejected(_)) => {
                        Err(TransportError::SubscriptionRejected(waiter.topic.clone()))
                    }
                    other => other,
                };
                if waiter.tx.send(result).is_err() {
                    debug!("Waiter for {} (pkid {}) went away", waiter.topic, pkid);
                }
            }
            None => warn!("Acknowledgment for unknown pkid {}", pkid),
        }
    }

    /// Fails every outstanding request, used when the event loop stops
    async fn fail_all(&self) {
        let mut guard = self.queues.lock().await;
        let queues = &mut *guard;
        let waiters = queues
            .subscribe
            .drain(..)
            .chain(queues.unsubscribe.drain(..))
            .chain(queues.in_flight.drain().map(|(_, waiter)| waiter));
        for waiter in waiters {
            let _ = waiter.tx.send(Err(TransportError::Closed));
        }
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum LinkState {
    Configured,
    Connecting,
    Established,
}

#[machine]
pub struct BrokerLink<S: LinkState> {
    label: String,
    options: MqttOptions,
    connect_timeout: Duration,
    request_capacity: usize,
    events: EventSink,
    acks: Arc<AckTracker>,
    shutdown: CancellationToken,
    client: Option<AsyncClient>,
    connack: Option<oneshot::Receiver<AckResult>>,
    poller: Option<JoinHandle<()>>,
}

impl BrokerLink<Configured> {
    pub fn create(endpoint: &BrokerEndpoint, settings: TransportSettings, events: EventSink) -> Self {
        let mut options = MqttOptions::new(
            settings.client_id.clone(),
            endpoint.host.clone(),
            endpoint.port,
        );
        options
            .set_keep_alive(settings.keep_alive)
            .set_clean_session(true);
        if let Some(credentials) = &endpoint.credentials {
            options.set_credentials(credentials.username.clone(), credentials.password.clone());
        }
        if endpoint.uses_tls() {
            options.set_transport(Transport::tls_with_default_config());
        }

        let label = format!("{}@{}", settings.client_id, endpoint);
        debug!("Configured broker link {}", label);

        Self::new(
            label,
            options,
            settings.connect_timeout,
            settings.request_capacity,
            events,
            Arc::new(AckTracker::default()),
            CancellationToken::new(),
            None, // client
            None, // connack
            None, // poller
        )
    }

    /// Creates the client and starts polling its event loop
    pub fn open(mut self) -> BrokerLink<Connecting> {
        info!("Opening broker link {}", self.label);
        let (client, eventloop) = AsyncClient::new(self.options.clone(), self.request_capacity);
        let (connack_tx, connack_rx) = oneshot::channel();

        let poller = tokio::spawn(drive_event_loop(
            self.label.clone(),
            eventloop,
            self.events.clone(),
            self.acks.clone(),
            connack_tx,
            self.shutdown.clone(),
        ));

        self.client = Some(client);
        self.connack = Some(connack_rx);
        self.poller = Some(poller);
        self.transition()
    }
}

impl BrokerLink<Connecting> {
    /// Waits for the broker's CONNACK, bounded by the connect timeout
    pub async fn await_connack(mut self) -> Result<BrokerLink<Established>, TransportError> {
        let connack = self
            .connack
            .take()
            .ok_or_else(|| TransportError::Connection("link was never opened".to_string()))?;

        let outcome = match tokio::time::timeout(self.connect_timeout, connack).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout(self.connect_timeout)),
        };

        match outcome {
            Ok(()) => {
                info!("Broker link {} established", self.label);
                Ok(self.transition())
            }
            Err(e) => {
                error!("Broker link {} failed: {}", self.label, e);
                self.shutdown.cancel();
                Err(e)
            }
        }
    }
}

impl BrokerLink<Established> {
    pub fn into_transport(self) -> Result<RumqttTransport, TransportError> {
        let client = self
            .client
            .ok_or_else(|| TransportError::Connection("link has no client".to_string()))?;
        let poller = self
            .poller
            .ok_or_else(|| TransportError::Connection("link has no event loop".to_string()))?;
        Ok(RumqttTransport {
            label: self.label,
            client,
            acks: self.acks,
            shutdown: self.shutdown,
            poller,
        })
    }
}

fn suback_result(ack: &SubAck) -> AckResult {
    let rejected = ack
        .return_codes
        .iter()
        .any(|code| matches!(code, SubscribeReasonCode::Failure));
    if rejected {
        Err(TransportError::SubscriptionRejected(format!("pkid {}", ack.pkid)))
    } else {
        Ok(())
    }
}

async fn drive_event_loop(
    label: String,
    mut eventloop: EventLoop,
    events: EventSink,
    acks: Arc<AckTracker>,
    connack_tx: oneshot::Sender<AckResult>,
    shutdown: CancellationToken,
) {
    let mut connack_tx = Some(connack_tx);
    let mut established = false;

    loop {
        let polled = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Event loop for {} cancelled", label);
                break;
            }
            polled = eventloop.poll() => polled,
        };

        match polled {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                let result = if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(TransportError::Refused(format!("{:?}", ack.code)))
                };
                let refused = result.is_err();
                established = !refused;
                match connack_tx.take() {
                    Some(tx) => {
                        let _ = tx.send(result);
                    }
                    None => warn!("Unexpected CONNACK on {}", label),
                }
                if refused {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(
                    "Received {} bytes on {} via {}",
                    publish.payload.len(),
                    publish.topic,
                    label
                );
                let message = MQTTMessage::from_topic(publish.topic, publish.payload.to_vec());
                if !events.emit(TransportEvent::Message(message)).await {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                acks.resolve(ack.pkid, suback_result(&ack)).await;
            }
            Ok(Event::Incoming(Packet::UnsubAck(ack))) => {
                acks.resolve(ack.pkid, Ok(())).await;
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("Broker closed the session on {}", label);
                break;
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                acks.bind(AckKind::Subscribe, pkid).await;
            }
            Ok(Event::Outgoing(Outgoing::Unsubscribe(pkid))) => {
                acks.bind(AckKind::Unsubscribe, pkid).await;
            }
            Ok(other) => {
                debug!("MQTT event on {}: {:?}", label, other);
            }
            Err(e) => {
                error!("Event loop error on {}: {}", label, e);
                match connack_tx.take() {
                    Some(tx) => {
                        let _ = tx.send(Err(TransportError::Connection(e.to_string())));
                    }
                    None => {
                        events.emit(TransportEvent::Error(e.to_string())).await;
                    }
                }
                break;
            }
        }
    }

    acks.fail_all().await;
    if established && !shutdown.is_cancelled() {
        events.emit(TransportEvent::Closed).await;
    }
    info!("Event loop for {} stopped", label);
}

/// Live connection produced by [`RumqttFactory`]
pub struct RumqttTransport {
    label: String,
    client: AsyncClient,
    acks: Arc<AckTracker>,
    shutdown: CancellationToken,
    poller: JoinHandle<()>,
}

impl RumqttTransport {
    async fn request_ack(&self, kind: AckKind, topic: &str) -> AckResult {
        let ack = {
            let _gate = self.acks.gate.lock().await;
            let ack = self.acks.enqueue(kind, topic).await;
            let sent = match kind {
                AckKind::Subscribe => self.client.subscribe(topic, QoS::AtMostOnce).await,
                AckKind::Unsubscribe => self.client.unsubscribe(topic).await,
            };
            if let Err(e) = sent {
                self.acks.withdraw(kind).await;
                warn!("{:?} {} refused by client {}: {}", kind, topic, self.label, e);
                return Err(TransportError::Request(e.to_string()));
            }
            ack
        };

        ack.await.unwrap_or(Err(TransportError::Closed))
    }
}

#[async_trait]
impl MqttTransport for RumqttTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| TransportError::Request(e.to_string()))
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.request_ack(AckKind::Subscribe, topic).await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.request_ack(AckKind::Unsubscribe, topic).await
    }

    async fn close(&self) {
        info!("Closing broker link {}", self.label);
        self.shutdown.cancel();
        // Pending waiters observe the dropped senders as a closed connection
        self.poller.abort();
    }
}

impl Drop for RumqttTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.poller.abort();
    }
}

/// Opens rumqttc connections with automatic reconnection disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct RumqttFactory;

#[async_trait]
impl TransportFactory for RumqttFactory {
    async fn open(
        &self,
        endpoint: &BrokerEndpoint,
        settings: TransportSettings,
        events: EventSink,
    ) -> Result<Box<dyn MqttTransport>, TransportError> {
        let link = BrokerLink::<Configured>::create(endpoint, settings, events)
            .open()
            .await_connack()
            .await?;
        Ok(Box::new(link.into_transport()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acks_reach_their_own_waiters() {
        let acks = AckTracker::default();
        let sub_a = acks.enqueue(AckKind::Subscribe, "a").await;
        let sub_b = acks.enqueue(AckKind::Subscribe, "b").await;
        let unsub_c = acks.enqueue(AckKind::Unsubscribe, "c").await;

        acks.bind(AckKind::Subscribe, 10).await;
        acks.bind(AckKind::Unsubscribe, 11).await;
        acks.bind(AckKind::Subscribe, 12).await;

        acks.resolve(12, Ok(())).await;
        acks.resolve(
            10,
            Err(TransportError::SubscriptionRejected("pkid 10".to_string())),
        )
        .await;
        acks.resolve(11, Ok(())).await;

        assert_eq!(
            sub_a.await.unwrap(),
            Err(TransportError::SubscriptionRejected("a".to_string()))
        );
        assert_eq!(sub_b.await.unwrap(), Ok(()));
        assert_eq!(unsub_c.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn withdraw_drops_only_the_newest_waiter() {
        let acks = AckTracker::default();
        let first = acks.enqueue(AckKind::Subscribe, "first").await;
        let second = acks.enqueue(AckKind::Subscribe, "second").await;

        acks.withdraw(AckKind::Subscribe).await;
        assert!(second.await.is_err());

        acks.bind(AckKind::Subscribe, 3).await;
        acks.resolve(3, Ok(())).await;
        assert_eq!(first.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn fail_all_closes_queued_and_in_flight_waiters() {
        let acks = AckTracker::default();
        let in_flight = acks.enqueue(AckKind::Subscribe, "a").await;
        acks.bind(AckKind::Subscribe, 1).await;
        let queued_sub = acks.enqueue(AckKind::Subscribe, "b").await;
        let queued_unsub = acks.enqueue(AckKind::Unsubscribe, "c").await;

        acks.fail_all().await;

        for waiter in [in_flight, queued_sub, queued_unsub] {
            assert_eq!(waiter.await.unwrap(), Err(TransportError::Closed));
        }
        // Late acknowledgments for failed waiters are ignored
        acks.resolve(1, Ok(())).await;
    }

    #[tokio::test]
    async fn unknown_pkid_leaves_waiters_pending() {
        let acks = AckTracker::default();
        let mut waiter = acks.enqueue(AckKind::Unsubscribe, "a").await;
        acks.bind(AckKind::Unsubscribe, 5).await;

        acks.resolve(6, Ok(())).await;
        assert!(waiter.try_recv().is_err());

        acks.resolve(5, Ok(())).await;
        assert_eq!(waiter.await.unwrap(), Ok(()));
    }

    #[test]
    fn suback_failure_is_a_rejection() {
        let granted = SubAck {
            pkid: 4,
            return_codes: vec![SubscribeReasonCode::Success(QoS::AtMostOnce)],
        };
        assert_eq!(suback_result(&granted), Ok(()));

        let refused = SubAck {
            pkid: 4,
            return_codes: vec![SubscribeReasonCode::Failure],
        };
        assert!(matches!(
            suback_result(&refused),
            Err(TransportError::SubscriptionRejected(_))
        ));
    }
}
