//! Delivery of items to consumers.
//!
//! [`Notifier`] renders an item and hands it to the [`Transport`], one
//! consumer at a time.  A failure is logged with its source, consumer and
//! item id and then forgotten: nothing here retries, and the scheduler
//! advances the cursor regardless, so that consumer misses the item.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::error::TransportError;
use crate::source::Item;
use crate::store::ConsumerId;

/// The delivery channel (chat API, console, ...).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, consumer: &ConsumerId, text: &str) -> Result<(), TransportError>;
}

/// Message announcing a newly observed item.
pub fn render_new_item(source: &str, item: &Item) -> String {
    format!("@{source} new post:\n{}", item.permalink)
}

/// Lines of the one-time baseline dump, header first, then one permalink per
/// item in the order given (oldest first).
pub fn render_baseline(source: &str, items: &[Item]) -> Vec<String> {
    let header = if items.is_empty() {
        format!("Now tracking @{source}. No recent posts yet.")
    } else {
        format!("Now tracking @{source}.\nLast {} posts:", items.len())
    };
    std::iter::once(header)
        .chain(items.iter().map(|item| item.permalink.clone()))
        .collect()
}

/// Totals for one fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct Notifier {
    transport: Arc<dyn Transport>,
}

impl Notifier {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Deliver one item to one consumer.  Returns `false` on failure.
    pub async fn deliver(&self, source: &str, consumer: &ConsumerId, item: &Item) -> bool {
        let text = render_new_item(source, item);
        match self.transport.send(consumer, &text).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    source = %source,
                    consumer = %consumer,
                    item = %item.id,
                    error = %e,
                    "delivery failed"
                );
                false
            }
        }
    }

    /// Deliver every item, oldest first, to every consumer.  One consumer's
    /// failure never stops delivery to the others.
    pub async fn fan_out<'a>(
        &self,
        source: &str,
        items: &[Item],
        consumers: impl IntoIterator<Item = &'a ConsumerId> + Clone,
    ) -> FanOut {
        let mut totals = FanOut::default();
        for item in items {
            for consumer in consumers.clone() {
                if self.deliver(source, consumer, item).await {
                    totals.delivered += 1;
                } else {
                    totals.failed += 1;
                }
            }
        }
        totals
    }

    /// Send free-form text (command replies, baseline lines).
    pub async fn send_text(&self, consumer: &ConsumerId, text: &str) -> Result<(), TransportError> {
        self.transport.send(consumer, text).await
    }
}
