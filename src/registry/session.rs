use chrono::{DateTime, Local};
use std::collections::HashSet;

/// Opaque identity of the user a directive came from
pub type UserId = String;

/// Per-user subscription state
///
/// Created on the first directive from a user and kept for the lifetime of the
/// process. Only the registry mutates it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    user: UserId,
    topics: HashSet<String>,
    last_operation: Option<String>,
    last_operation_at: Option<DateTime<Local>>,
    operations: u64,
}

impl Session {
    pub fn new(user: impl Into<UserId>) -> Self {
        Self {
            user: user.into(),
            topics: HashSet::new(),
            last_operation: None,
            last_operation_at: None,
            operations: 0,
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn holds(&self, topic: &str) -> bool {
        self.topics.contains(topic)
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Topics in lexical order
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.iter().cloned().collect();
        topics.sort();
        topics
    }

    pub fn last_operation(&self) -> Option<&str> {
        self.last_operation.as_deref()
    }

    pub fn last_operation_at(&self) -> Option<DateTime<Local>> {
        self.last_operation_at
    }

    pub fn operations(&self) -> u64 {
        self.operations
    }

    pub(crate) fn insert_topic(&mut self, topic: &str) -> bool {
        self.topics.insert(topic.to_string())
    }

    pub(crate) fn remove_topic(&mut self, topic: &str) -> bool {
        self.topics.remove(topic)
    }

    /// Drops every topic, returns how many there were
    pub(crate) fn clear_topics(&mut self) -> usize {
        let count = self.topics.len();
        self.topics.clear();
        count
    }

    pub(crate) fn record(&mut self, label: &str) {
        self.last_operation = Some(label.to_string());
        self.last_operation_at = Some(Local::now());
        self.operations += 1;
    }
}
