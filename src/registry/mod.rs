//! Subscription registry
//!
//! Keeps two views of the same relation consistent:
//!
//! ```text
//! sessions: user  ──► Session { topics, last operation, counter }
//! topics:   topic ──► { users }
//! ```
//!
//! A user is in `topics[T]` iff `T` is in that user's session, and a topic whose
//! subscriber set runs empty is removed on the spot. Both maps live behind one lock
//! so every mutation updates both sides at once.
//!
//! Subscribe and unsubscribe only commit after the broker acknowledged the request,
//! and only if the connection that acknowledged it is still the current one. The
//! index remembers which connection generation its contents belong to; contents of
//! an older generation never count as a live subscription.

mod session;
mod topic_locks;

pub use session::{Session, UserId};
pub use topic_locks::TopicLocks;

use crate::error::RelayError;
use crate::mqtt::ConnectionManager;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct RegistryState {
    // Connection generation the subscriptions below were made on
    epoch: u64,
    sessions: HashMap<UserId, Session>,
    topics: HashMap<String, HashSet<UserId>>,
}

impl RegistryState {
    fn holds(&self, generation: u64, user: &str, topic: &str) -> bool {
        self.epoch == generation
            && self
                .sessions
                .get(user)
                .is_some_and(|session| session.holds(topic))
    }

    fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, HashSet::len)
    }

    fn topic_count(&self, user: &str) -> usize {
        self.sessions.get(user).map_or(0, Session::topic_count)
    }

    fn session_mut(&mut self, user: &str) -> &mut Session {
        self.sessions
            .entry(user.to_string())
            .or_insert_with(|| Session::new(user))
    }

    fn clear_subscriptions(&mut self) -> usize {
        let dropped = self
            .sessions
            .values_mut()
            .map(Session::clear_topics)
            .sum::<usize>();
        self.topics.clear();
        dropped
    }

    fn attach(&mut self, generation: u64, user: &str, topic: &str) {
        if self.epoch != generation {
            let dropped = self.clear_subscriptions();
            if dropped > 0 {
                debug!(
                    "Dropped {} subscription(s) left over from connection {}",
                    dropped, self.epoch
                );
            }
            self.epoch = generation;
        }
        self.session_mut(user).insert_topic(topic);
        self.topics
            .entry(topic.to_string())
            .or_default()
            .insert(user.to_string());
    }

    fn detach(&mut self, user: &str, topic: &str) {
        if let Some(session) = self.sessions.get_mut(user) {
            session.remove_topic(topic);
        }
        if let Some(users) = self.topics.get_mut(topic) {
            users.remove(user);
            if users.is_empty() {
                self.topics.remove(topic);
                debug!("Topic {} has no subscribers left", topic);
            }
        }
    }
}

pub struct SubscriptionRegistry {
    connection: Arc<ConnectionManager>,
    state: RwLock<RegistryState>,
    locks: TopicLocks,
}

impl SubscriptionRegistry {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self {
            connection,
            state: RwLock::new(RegistryState::default()),
            locks: TopicLocks::default(),
        }
    }

    /// Returns a snapshot of the user's session, creating it on first contact
    pub async fn session(&self, user: &str) -> Session {
        self.state.write().await.session_mut(user).clone()
    }

    /// Stamps a successful operation on the user's session
    pub async fn record_operation(&self, user: &str, label: &str) {
        self.state.write().await.session_mut(user).record(label);
    }

    /// Subscribes `user` to `topic` once the broker confirmed it
    ///
    /// Returns the number of topics the user holds afterwards.
    ///
    /// # Errors
    ///
    /// * [`RelayError::NotConnected`] - no live connection, or it was torn down while
    ///   waiting for the broker
    /// * [`RelayError::AlreadySubscribed`] - the user already holds the topic; the
    ///   broker is not contacted
    /// * [`RelayError::Transport`] - the broker rejected the request
    pub async fn subscribe(&self, user: &str, topic: &str) -> Result<usize, RelayError> {
        let _topic_guard = self.locks.acquire(topic).await;

        let (generation, transport) = self
            .connection
            .live_transport()
            .await
            .ok_or(RelayError::NotConnected)?;

        if self.state.read().await.holds(generation, user, topic) {
            return Err(RelayError::AlreadySubscribed(topic.to_string()));
        }

        transport.subscribe(topic).await?;

        let mut state = self.state.write().await;
        if !self.connection.is_current(generation) {
            warn!(
                "Connection changed while subscribing {} to {}, not recording it",
                user, topic
            );
            return Err(RelayError::NotConnected);
        }
        state.attach(generation, user, topic);
        info!(
            "{} subscribed to {} ({} subscriber(s))",
            user,
            topic,
            state.subscriber_count(topic)
        );
        Ok(state.topic_count(user))
    }

    /// Removes `user` from `topic` once the broker confirmed it
    ///
    /// The broker-level unsubscribe is only sent when `user` is the last local
    /// subscriber; otherwise the shared broker subscription stays in place for the
    /// others. Returns the number of topics the user holds afterwards.
    pub async fn unsubscribe(&self, user: &str, topic: &str) -> Result<usize, RelayError> {
        let _topic_guard = self.locks.acquire(topic).await;

        let (generation, transport) = self
            .connection
            .live_transport()
            .await
            .ok_or(RelayError::NotConnected)?;

        let last_subscriber = {
            let state = self.state.read().await;
            if !state.holds(generation, user, topic) {
                return Err(RelayError::NotSubscribed(topic.to_string()));
            }
            state.subscriber_count(topic) == 1
        };

        if last_subscriber {
            transport.unsubscribe(topic).await?;
        } else {
            debug!("{} still has other subscribers, keeping broker subscription", topic);
        }

        let mut state = self.state.write().await;
        if !self.connection.is_current(generation) {
            warn!(
                "Connection changed while unsubscribing {} from {}",
                user, topic
            );
            return Err(RelayError::NotConnected);
        }
        state.detach(user, topic);
        info!("{} unsubscribed from {}", user, topic);
        Ok(state.topic_count(user))
    }

    /// Unsubscribes every topic of `user` concurrently, best effort
    ///
    /// Returns how many topics were actually cleared.
    pub async fn clear_user(&self, user: &str) -> usize {
        let topics = self.list_user_topics(user).await;
        if topics.is_empty() {
            return 0;
        }

        let outcomes = join_all(topics.iter().map(|topic| self.unsubscribe(user, topic))).await;

        let mut cleared = 0;
        for (topic, outcome) in topics.iter().zip(outcomes) {
            match outcome {
                Ok(_) => cleared += 1,
                Err(e) => warn!("Clearing {} for {} failed: {}", topic, user, e),
            }
        }
        info!("Cleared {}/{} topic(s) for {}", cleared, topics.len(), user);
        cleared
    }

    /// Drops the whole index without talking to the broker
    ///
    /// Used when connection `generation` goes away. Subscriptions already made on a
    /// newer connection are left alone. Returns the number of `(user, topic)` pairs
    /// that were dropped.
    pub async fn clear_all(&self, generation: u64) -> usize {
        let mut state = self.state.write().await;
        if state.epoch > generation {
            debug!(
                "Index belongs to connection {}, not clearing for {}",
                state.epoch, generation
            );
            return 0;
        }
        let dropped = state.clear_subscriptions();
        if dropped > 0 {
            info!(
                "Dropped {} subscription(s) with connection {}",
                dropped, generation
            );
        }
        dropped
    }

    /// Topics of `user` in lexical order
    pub async fn list_user_topics(&self, user: &str) -> Vec<String> {
        self.state
            .read()
            .await
            .sessions
            .get(user)
            .map(Session::topics)
            .unwrap_or_default()
    }

    pub async fn subscribers_of(&self, topic: &str) -> HashSet<UserId> {
        self.state
            .read()
            .await
            .topics
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Users whose topic filter covers a message published on `topic`
    ///
    /// A user holding several overlapping filters (`a/+` and `a/#`) appears once.
    pub async fn subscribers_matching(&self, topic: &str) -> HashSet<UserId> {
        let state = self.state.read().await;
        state
            .topics
            .iter()
            .filter(|(filter, _)| *filter == topic || rumqttc::matches(topic, filter))
            .flat_map(|(_, users)| users.iter().cloned())
            .collect()
    }

    /// Every topic with at least one subscriber, in lexical order
    pub async fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.state.read().await.topics.keys().cloned().collect();
        topics.sort();
        topics
    }
}
