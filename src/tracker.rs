//! Operations exposed to the chat front-end.
//!
//! [`Tracker`] turns consumer intents into store mutations and direct
//! adapter calls.  It runs outside the tick loop and never retries:
//! failures go straight back to the requesting consumer.

use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info};

use crate::diff::baseline;
use crate::error::{SourceError, StoreError};
use crate::source::{Handle, Item, SourceAdapter};
use crate::store::{normalize_source, ConsumerId, SubscriptionStore, Upsert};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CommandError {
    /// Terse, classified text for the consumer.
    pub fn user_message(&self) -> String {
        match self {
            CommandError::Source(e) => e.user_message(),
            CommandError::Store(_) => "Could not save that change, try again later.".to_string(),
        }
    }
}

/// Result of a successful subscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscribed {
    /// The consumer now follows the source.  `baseline` is the current
    /// window, oldest first, shown to this consumer once.
    Created { source: String, baseline: Vec<Item> },
    AlreadySubscribed { source: String },
}

/// What to unsubscribe from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Source(String),
    All,
}

pub struct Tracker {
    store: Arc<SubscriptionStore>,
    adapter: Arc<dyn SourceAdapter>,
    window: usize,
}

impl Tracker {
    pub fn new(store: Arc<SubscriptionStore>, adapter: Arc<dyn SourceAdapter>, window: usize) -> Self {
        Self {
            store,
            adapter,
            window,
        }
    }

    fn normalize(raw: &str) -> Result<String, SourceError> {
        normalize_source(raw)
            .ok_or_else(|| SourceError::NotFound(raw.trim().trim_start_matches('@').to_string()))
    }

    async fn handle_for(&self, name: &str) -> Result<Handle, SourceError> {
        match self.store.get(name).await.and_then(|sub| sub.handle().cloned()) {
            Some(handle) => Ok(handle),
            None => self.adapter.resolve(name).await,
        }
    }

    /// Follow `raw_name`.
    ///
    /// Resolves the source and fetches its window under the source lock, then
    /// registers the consumer in one write.  A brand-new subscription is
    /// checkpointed at the newest item; joining an existing one leaves the
    /// shared cursor alone.
    pub async fn subscribe(
        &self,
        consumer: &ConsumerId,
        raw_name: &str,
    ) -> Result<Subscribed, CommandError> {
        let name = Self::normalize(raw_name)?;
        let already = |sub: Option<crate::store::Subscription>| {
            sub.is_some_and(|s| s.has_consumer(consumer))
        };

        if already(self.store.get(&name).await) {
            return Ok(Subscribed::AlreadySubscribed { source: name });
        }

        let _guard = self.store.lock_source(&name).await;
        if already(self.store.get(&name).await) {
            return Ok(Subscribed::AlreadySubscribed { source: name });
        }

        let handle = self.handle_for(&name).await?;
        let window = self.adapter.fetch_recent(&name, &handle, self.window).await?;
        let checkpoint = window.first().map(|item| item.id.clone());

        match self
            .store
            .upsert_seeded(&name, consumer, Some(handle), checkpoint)
            .await?
        {
            Upsert::AlreadySubscribed => Ok(Subscribed::AlreadySubscribed { source: name }),
            outcome => {
                info!(source = %name, consumer = %consumer, ?outcome, "subscribed");
                Ok(Subscribed::Created {
                    baseline: baseline(&window),
                    source: name,
                })
            }
        }
    }

    /// Stop following one source or all of them.  Returns the source names
    /// actually removed.
    pub async fn unsubscribe(
        &self,
        consumer: &ConsumerId,
        target: Target,
    ) -> Result<Vec<String>, CommandError> {
        let removed = match target {
            Target::All => self.store.remove_consumer_everywhere(consumer).await?,
            Target::Source(raw) => match normalize_source(&raw) {
                None => Vec::new(),
                Some(name) => {
                    if self.store.remove_consumer(&name, consumer).await? {
                        vec![name]
                    } else {
                        Vec::new()
                    }
                }
            },
        };
        if !removed.is_empty() {
            info!(consumer = %consumer, sources = ?removed, "unsubscribed");
        }
        Ok(removed)
    }

    pub async fn list_subscriptions(&self, consumer: &ConsumerId) -> Vec<String> {
        self.store.sources_of(consumer).await
    }

    /// Find the newest item in a fresh window whose body contains `query`
    /// (case-insensitive).  Bypasses cursors entirely.
    pub async fn search_recent(&self, raw_name: &str, query: &str) -> Result<Option<Item>, CommandError> {
        let name = Self::normalize(raw_name)?;
        let handle = self.handle_for(&name).await?;
        let window = self.adapter.fetch_recent(&name, &handle, self.window).await?;

        let needle = query.trim().to_lowercase();
        Ok(window
            .into_iter()
            .find(|item| item.body.to_lowercase().contains(&needle)))
    }
}

/// Log interactive failures that need an operator, not just the consumer.
pub fn report_command_error(err: &CommandError) {
    match err {
        CommandError::Source(SourceError::AuthExpired) => {
            error!("API credentials rejected during an interactive command");
        }
        CommandError::Store(e) => error!(error = %e, "store write failed during a command"),
        CommandError::Source(_) => {}
    }
}
