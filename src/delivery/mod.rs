//! Delivery of broker messages and directive responses to users
//!
//! [`Notifier`] is the outbound half of the chat transport. [`FanOut`] turns one
//! broker message into one notification per subscriber of its topic.

mod console;
mod fanout;

pub use console::ConsoleNotifier;
pub use fanout::{DeliveryReport, FanOut};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("recipient {0} is unreachable")]
    Unreachable(String),

    #[error("delivery failed: {0}")]
    Failed(String),
}

/// Sends text to a user identified by an opaque key
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user: &str, text: &str) -> Result<(), NotifyError>;
}

#[cfg(test)]
mod tests;
