use super::Relay;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const USER_QUEUE_CAPACITY: usize = 64;

/// Feeds chat lines into the relay with one worker per user
///
/// Lines from the same user are handled strictly in arrival order, so a `subscribe`
/// is settled before the `list` typed after it. Different users do not wait on each
/// other.
pub struct Inbox {
    relay: Arc<Relay>,
    queues: HashMap<String, mpsc::Sender<String>>,
    workers: Vec<JoinHandle<()>>,
}

impl Inbox {
    pub fn new(relay: Arc<Relay>) -> Self {
        Self {
            relay,
            queues: HashMap::new(),
            workers: Vec::new(),
        }
    }

    /// Queues `text` behind everything `user` sent before
    pub async fn push(&mut self, user: &str, text: &str) {
        let queue = match self.queues.get(user) {
            Some(queue) => queue.clone(),
            None => self.open(user),
        };
        if queue.send(text.to_string()).await.is_err() {
            warn!("Worker for {} is gone, dropping: {}", user, text);
        }
    }

    fn open(&mut self, user: &str) -> mpsc::Sender<String> {
        let (tx, mut rx) = mpsc::channel::<String>(USER_QUEUE_CAPACITY);
        let relay = self.relay.clone();
        let owner = user.to_string();
        self.workers.push(tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                relay.submit(&owner, &text).await;
            }
            debug!("Inbox worker for {} finished", owner);
        }));
        self.queues.insert(user.to_string(), tx.clone());
        tx
    }

    /// Stops accepting lines and waits until every queued one was handled
    pub async fn close(self) {
        drop(self.queues);
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!("Inbox worker ended abnormally: {}", e);
            }
        }
    }
}
