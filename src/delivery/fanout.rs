use super::Notifier;
use crate::mqtt::MQTTMessage;
use crate::registry::SubscriptionRegistry;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of delivering one broker message
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
}

pub struct FanOut {
    registry: Arc<SubscriptionRegistry>,
    notifier: Arc<dyn Notifier>,
}

impl FanOut {
    pub fn new(registry: Arc<SubscriptionRegistry>, notifier: Arc<dyn Notifier>) -> Self {
        Self { registry, notifier }
    }

    /// Sends `[<topic>]: <payload>` to every user whose filter matches the message topic
    ///
    /// The subscriber set is snapshotted first; each delivery runs independently and a
    /// failing recipient neither stops the others nor changes the registry.
    pub async fn deliver(&self, message: &MQTTMessage) -> DeliveryReport {
        let subscribers = self.registry.subscribers_matching(message.topic()).await;
        if subscribers.is_empty() {
            debug!("No subscribers for {}, discarding message", message.topic());
            return DeliveryReport::default();
        }

        let text = message.render();
        let attempts = subscribers.iter().map(|user| {
            let text = &text;
            async move { (user, self.notifier.notify(user, text).await) }
        });

        let mut report = DeliveryReport::default();
        for (user, outcome) in join_all(attempts).await {
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!("Delivering {} to {} failed: {}", message.topic(), user, e);
                    report.failed += 1;
                }
            }
        }

        info!(
            "Fanned out {} to {} subscriber(s), {} failed",
            message.topic(),
            report.delivered,
            report.failed
        );
        report
    }
}
