//! In-memory stand-ins for the broker and the chat transport

use crate::delivery::{NotifyError, Notifier};
use crate::mqtt::{
    BrokerEndpoint, ConnectionEvent, ConnectionManager, ConnectionSettings, EventSink,
    MQTTMessage, MqttTransport, TransportError, TransportEvent, TransportFactory,
    TransportSettings,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

#[derive(Default)]
struct BrokerState {
    subscriptions: HashSet<String>,
    published: Vec<(String, Vec<u8>)>,
    calls: Vec<String>,
    reject_topics: HashSet<String>,
    refuse_connect: bool,
    fail_publish: bool,
    sink: Option<EventSink>,
    last_endpoint: Option<BrokerEndpoint>,
    last_client_id: Option<String>,
    ack_gate: Option<Arc<Semaphore>>,
    opened: usize,
    closed: usize,
}

/// Fake broker shared between the factory, its transports and the test body
#[derive(Default)]
pub struct MockBroker {
    state: Mutex<BrokerState>,
}

impl MockBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn refuse_connect(&self) {
        self.state.lock().unwrap().refuse_connect = true;
    }

    pub fn reject(&self, topic: &str) {
        self.state
            .lock()
            .unwrap()
            .reject_topics
            .insert(topic.to_string());
    }

    /// Subscribe and unsubscribe calls wait for [`MockBroker::release_acks`] once
    /// they reached the broker
    pub fn hold_acks(&self) {
        self.state.lock().unwrap().ack_gate = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_acks(&self) {
        if let Some(gate) = self.state.lock().unwrap().ack_gate.take() {
            gate.add_permits(1);
        }
    }

    /// Yields until `call` shows up in the call log
    pub async fn wait_for_call(&self, call: &str) {
        while !self.calls().iter().any(|c| c == call) {
            tokio::task::yield_now().await;
        }
    }

    async fn await_ack(&self) {
        let gate = self.state.lock().unwrap().ack_gate.clone();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await.unwrap();
        }
    }

    pub fn fail_publish(&self) {
        self.state.lock().unwrap().fail_publish = true;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn subscriptions(&self) -> HashSet<String> {
        self.state.lock().unwrap().subscriptions.clone()
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.state.lock().unwrap().published.clone()
    }

    pub fn opened(&self) -> usize {
        self.state.lock().unwrap().opened
    }

    pub fn closed(&self) -> usize {
        self.state.lock().unwrap().closed
    }

    pub fn last_endpoint(&self) -> Option<BrokerEndpoint> {
        self.state.lock().unwrap().last_endpoint.clone()
    }

    pub fn last_client_id(&self) -> Option<String> {
        self.state.lock().unwrap().last_client_id.clone()
    }

    /// Simulates the broker delivering a message on the current connection
    pub async fn deliver(&self, topic: &str, payload: &str) {
        let sink = self.state.lock().unwrap().sink.clone();
        sink.expect("no open connection")
            .emit(TransportEvent::Message(MQTTMessage::from_topic(
                topic,
                payload.as_bytes().to_vec(),
            )))
            .await;
    }

    /// Simulates the broker dropping the connection
    pub async fn drop_connection(&self) {
        let sink = self.state.lock().unwrap().sink.clone();
        let sink = sink.expect("no open connection");
        sink.emit(TransportEvent::Error("connection reset by peer".to_string()))
            .await;
        sink.emit(TransportEvent::Closed).await;
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }
}

pub struct MockTransport {
    broker: Arc<MockBroker>,
}

#[async_trait]
impl MqttTransport for MockTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.broker.record(format!("publish {}", topic));
        let mut state = self.broker.state.lock().unwrap();
        if state.fail_publish {
            return Err(TransportError::Request("publish queue full".to_string()));
        }
        state.published.push((topic.to_string(), payload));
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        tokio::task::yield_now().await;
        self.broker.record(format!("subscribe {}", topic));
        self.broker.await_ack().await;
        let mut state = self.broker.state.lock().unwrap();
        if state.reject_topics.contains(topic) {
            return Err(TransportError::SubscriptionRejected(topic.to_string()));
        }
        state.subscriptions.insert(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        tokio::task::yield_now().await;
        self.broker.record(format!("unsubscribe {}", topic));
        self.broker.await_ack().await;
        let mut state = self.broker.state.lock().unwrap();
        if state.reject_topics.contains(topic) {
            return Err(TransportError::Request(format!("cannot unsubscribe {}", topic)));
        }
        state.subscriptions.remove(topic);
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.broker.state.lock().unwrap();
        state.closed += 1;
        state.subscriptions.clear();
        state.sink = None;
    }
}

pub struct MockFactory {
    broker: Arc<MockBroker>,
}

impl MockFactory {
    pub fn new(broker: Arc<MockBroker>) -> Arc<Self> {
        Arc::new(Self { broker })
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn open(
        &self,
        endpoint: &BrokerEndpoint,
        settings: TransportSettings,
        events: EventSink,
    ) -> Result<Box<dyn MqttTransport>, TransportError> {
        let mut state = self.broker.state.lock().unwrap();
        state.last_endpoint = Some(endpoint.clone());
        state.last_client_id = Some(settings.client_id);
        if state.refuse_connect {
            return Err(TransportError::Refused("NotAuthorized".to_string()));
        }
        state.opened += 1;
        state.sink = Some(events);
        Ok(Box::new(MockTransport {
            broker: self.broker.clone(),
        }))
    }
}

/// Notifier that keeps everything it was asked to send
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, String)>>,
    unreachable: Mutex<HashSet<String>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn make_unreachable(&self, user: &str) {
        self.unreachable.lock().unwrap().insert(user.to_string());
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, user: &str) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|(to, _)| to == user)
            .map(|(_, text)| text)
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, user: &str, text: &str) -> Result<(), NotifyError> {
        if self.unreachable.lock().unwrap().contains(user) {
            return Err(NotifyError::Unreachable(user.to_string()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((user.to_string(), text.to_string()));
        Ok(())
    }
}

pub fn test_settings() -> ConnectionSettings {
    ConnectionSettings {
        client_id_prefix: "test".to_string(),
        keep_alive: Duration::from_secs(30),
        connect_timeout: Duration::from_secs(1),
        request_capacity: 10,
    }
}

/// Connection manager over a [`MockBroker`] plus the receiving end of its events
pub fn mock_connection(
    broker: &Arc<MockBroker>,
) -> (Arc<ConnectionManager>, mpsc::Receiver<ConnectionEvent>) {
    let (tx, rx) = mpsc::channel(100);
    let manager = ConnectionManager::new(MockFactory::new(broker.clone()), test_settings(), tx);
    (Arc::new(manager), rx)
}
