//! Durable subscription registry.
//!
//! [`SubscriptionStore`] owns the map from source name to [`Subscription`].
//! Every mutation is applied to a copy of the map, persisted through the
//! injected [`Persistence`], and only then published, so a successful return
//! means the change is both visible and durable.  A failed save leaves the
//! in-memory state untouched.
//!
//! Mutations are serialized by a single async mutex held across the save, so
//! dependent writes can never reach disk out of order.  Separately,
//! [`SubscriptionStore::lock_source`] hands out a per-source guard that the
//! scheduler holds for a whole fetch → diff → deliver → commit sequence and
//! that the façade holds while seeding a new subscription.

mod snapshot;
mod subscription;

pub use snapshot::{JsonFilePersistence, Persistence, Snapshot};
pub use subscription::{normalize_source, ConsumerId, Removal, Subscription};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::source::Handle;

type Registry = BTreeMap<String, Subscription>;

/// Outcome of [`SubscriptionStore::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// No subscription existed; one was created for this consumer.
    Created,
    /// The source was already tracked; the consumer joined it.
    Joined,
    /// The consumer already followed the source.
    AlreadySubscribed,
}

pub struct SubscriptionStore {
    persistence: Arc<dyn Persistence>,
    registry: Mutex<Registry>,
    source_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SubscriptionStore {
    /// Load the registry from `persistence`.
    ///
    /// Records that violate the subscription invariants (no consumers,
    /// unnormalized name) are dropped with a warning.
    pub async fn open(persistence: Arc<dyn Persistence>) -> Result<Self, StoreError> {
        let snapshot = persistence.load().await?;
        let mut registry = Registry::new();
        for sub in snapshot.subscriptions {
            if !sub.is_valid() {
                warn!(source = %sub.source_name(), "dropping invalid subscription record");
                continue;
            }
            registry.insert(sub.source_name().to_string(), sub);
        }
        debug!(subscriptions = registry.len(), "subscription store opened");

        Ok(Self {
            persistence,
            registry: Mutex::new(registry),
            source_locks: std::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Acquire exclusive use of one source for a poll or a seeding subscribe.
    ///
    /// Locks nobody holds or waits on are dropped here, so names that never
    /// became subscriptions do not accumulate.
    pub async fn lock_source(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.source_locks.lock() {
                Ok(locks) => locks,
                Err(poisoned) => poisoned.into_inner(),
            };
            // Holders and waiters each own a clone, so a count of one is idle.
            locks.retain(|key, lock| key == name || Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(name.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    fn source_lock_count(&self) -> usize {
        match self.source_locks.lock() {
            Ok(locks) => locks.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Apply `f` to a copy of the registry and persist it if `f` reports a
    /// change.  The live registry is only replaced after a successful save.
    async fn mutate<R>(&self, f: impl FnOnce(&mut Registry) -> (R, bool)) -> Result<R, StoreError> {
        let mut live = self.registry.lock().await;
        let mut next = live.clone();
        let (result, changed) = f(&mut next);
        if changed {
            let snapshot = Snapshot::new(next.values().cloned().collect());
            self.persistence.save(&snapshot).await?;
            *live = next;
        }
        Ok(result)
    }

    /// Create the subscription if absent, otherwise add the consumer to it.
    /// Idempotent.
    pub async fn upsert(&self, name: &str, consumer: &ConsumerId) -> Result<Upsert, StoreError> {
        self.upsert_seeded(name, consumer, None, None).await
    }

    /// [`upsert`](Self::upsert) that also records what the façade learned
    /// while subscribing, in the same write.
    ///
    /// `handle` fills in a missing handle.  `checkpoint` becomes the cursor
    /// only when the subscription is created here; an existing cursor is
    /// never touched, or other consumers would miss items.
    pub async fn upsert_seeded(
        &self,
        name: &str,
        consumer: &ConsumerId,
        handle: Option<Handle>,
        checkpoint: Option<String>,
    ) -> Result<Upsert, StoreError> {
        self.mutate(|registry| match registry.get_mut(name) {
            Some(sub) => {
                let mut changed = false;
                if sub.handle().is_none() && handle.is_some() {
                    sub.set_handle(handle);
                    changed = true;
                }
                if sub.add_consumer(consumer.clone()) {
                    (Upsert::Joined, true)
                } else {
                    (Upsert::AlreadySubscribed, changed)
                }
            }
            None => {
                let mut sub = Subscription::new(name, consumer.clone());
                sub.set_handle(handle);
                sub.set_cursor(checkpoint);
                registry.insert(name.to_string(), sub);
                (Upsert::Created, true)
            }
        })
        .await
    }

    /// Remove the consumer from one source, deleting the subscription when it
    /// was the last.  Returns whether the consumer was subscribed.
    pub async fn remove_consumer(&self, name: &str, consumer: &ConsumerId) -> Result<bool, StoreError> {
        self.mutate(|registry| {
            let Some(sub) = registry.get_mut(name) else {
                return (false, false);
            };
            match sub.remove_consumer(consumer) {
                Removal::Absent => (false, false),
                Removal::Kept => (true, true),
                Removal::Emptied => {
                    registry.remove(name);
                    (true, true)
                }
            }
        })
        .await
    }

    /// Remove the consumer from every source it follows, in one write.
    /// Returns the affected source names.
    pub async fn remove_consumer_everywhere(
        &self,
        consumer: &ConsumerId,
    ) -> Result<Vec<String>, StoreError> {
        self.mutate(|registry| {
            let mut removed = Vec::new();
            registry.retain(|name, sub| match sub.remove_consumer(consumer) {
                Removal::Absent => true,
                Removal::Kept => {
                    removed.push(name.clone());
                    true
                }
                Removal::Emptied => {
                    removed.push(name.clone());
                    false
                }
            });
            let changed = !removed.is_empty();
            (removed, changed)
        })
        .await
    }

    /// Overwrite the cursor of one source.
    ///
    /// If the source was removed while it was being polled there is nothing
    /// to advance; that is logged and treated as success.
    pub async fn advance_cursor(&self, name: &str, cursor: &str) -> Result<(), StoreError> {
        let found = self
            .mutate(|registry| match registry.get_mut(name) {
                None => (false, false),
                Some(sub) if sub.cursor() == Some(cursor) => (true, false),
                Some(sub) => {
                    sub.set_cursor(Some(cursor.to_string()));
                    (true, true)
                }
            })
            .await?;
        if !found {
            warn!(source = %name, cursor, "cursor advance for a source that no longer exists");
        }
        Ok(())
    }

    /// Cache (or with `None`, forget) the resolved handle of a source.
    pub async fn set_handle(&self, name: &str, handle: Option<Handle>) -> Result<(), StoreError> {
        self.mutate(|registry| match registry.get_mut(name) {
            Some(sub) if sub.handle() != handle.as_ref() => {
                sub.set_handle(handle);
                ((), true)
            }
            _ => ((), false),
        })
        .await
    }

    pub async fn get(&self, name: &str) -> Option<Subscription> {
        self.registry.lock().await.get(name).cloned()
    }

    /// Every subscription, for the scheduler's sweep.
    pub async fn list_all(&self) -> Vec<Subscription> {
        self.registry.lock().await.values().cloned().collect()
    }

    pub async fn consumers_of(&self, name: &str) -> Vec<ConsumerId> {
        self.registry
            .lock()
            .await
            .get(name)
            .map(|sub| sub.consumers().iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Source names the consumer follows, sorted.
    pub async fn sources_of(&self, consumer: &ConsumerId) -> Vec<String> {
        self.registry
            .lock()
            .await
            .values()
            .filter(|sub| sub.has_consumer(consumer))
            .map(|sub| sub.source_name().to_string())
            .collect()
    }
}
