use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async critical section per topic
///
/// Subscribe and unsubscribe hold the lock of their topic across the broker round
/// trip, which serializes every `(user, topic)` pair and the shared broker-level
/// subscription of that topic. Entries nobody holds or waits on are pruned.
#[derive(Debug, Default)]
pub struct TopicLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TopicLocks {
    pub async fn acquire(&self, topic: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(topic.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    pub async fn tracked(&self) -> usize {
        self.locks.lock().await.len()
    }
}
