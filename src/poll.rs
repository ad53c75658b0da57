//! Background polling.
//!
//! [`PollScheduler`] runs one tick per interval.  A tick reads every
//! subscription, and for each source (the registry is keyed by source, so
//! a source is fetched once no matter how many consumers follow it):
//!
//! ```text
//! Idle → Fetching → Diffing → Delivering → Committing → Idle
//! ```
//!
//! Distinct sources are polled concurrently up to
//! [`SchedulerConfig::concurrency`].  The whole sequence for one source runs
//! under that source's store lock, so two polls (or a poll and a seeding
//! subscribe) never race on the same cursor.
//!
//! ## Failure handling
//!
//! * `Transient` — retried in place a bounded number of times, then the
//!   source is skipped until the next tick.
//! * `RateLimited` — the source cools down for the provider's hint (or
//!   [`SchedulerConfig::default_cooldown`]); other sources are unaffected.
//! * `AuthExpired` — polling halts.  Sources not yet started in the current
//!   tick are skipped and their cursors untouched; later ticks do nothing
//!   until [`PollScheduler::refresh_and_resume`] succeeds.
//! * `NotFound` — the cached handle is dropped so the next tick re-resolves.
//!
//! ## Delivery before commit
//!
//! The cursor is committed only after every delivery for the source has been
//! attempted.  A crash in between re-delivers those items on the next run
//! (duplicates) instead of silently dropping them.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::diff::diff;
use crate::error::SourceError;
use crate::notify::Notifier;
use crate::retry::{retry_transient, RetryConfig};
use crate::source::{Handle, SourceAdapter};
use crate::store::SubscriptionStore;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerConfig {
    /// Sleep between the end of one tick and the start of the next.
    pub interval: Duration,
    /// Fetch window size.
    pub window: usize,
    /// Maximum sources fetched at once.
    pub concurrency: usize,
    /// Cooldown after a rate limit that carried no retry hint.
    pub default_cooldown: Duration,
    pub retry: RetryConfig,
}

/// Where a source's poll currently is.  Logged at debug level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Fetching,
    Diffing,
    Delivering,
    Committing,
}

/// What happened to one source in one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// New items were fanned out and the cursor committed.
    Delivered { items: usize, failed: usize, gap: bool },
    /// First observation: the newest item became the checkpoint.
    Checkpointed,
    /// Nothing new.
    Unchanged,
    /// Still inside a rate-limit cooldown; not fetched.
    CoolingDown,
    RateLimited,
    /// Transient failures exhausted the retry budget.
    Transient,
    NotFound,
    AuthExpired,
    /// Not started: shutdown, auth halt, or the source was unsubscribed.
    Skipped,
    /// Items were delivered but the cursor could not be persisted.
    CommitFailed,
}

#[derive(Debug, Default)]
pub struct TickReport {
    pub outcomes: BTreeMap<String, PollOutcome>,
    /// The tick did not run because polling is halted.
    pub halted: bool,
}

impl TickReport {
    fn count(&self, pred: impl Fn(&PollOutcome) -> bool) -> usize {
        self.outcomes.values().filter(|o| pred(o)).count()
    }
}

pub struct PollScheduler {
    store: Arc<SubscriptionStore>,
    adapter: Arc<dyn SourceAdapter>,
    notifier: Notifier,
    config: SchedulerConfig,
    cooldowns: Mutex<HashMap<String, Instant>>,
    auth_halted: AtomicBool,
}

impl PollScheduler {
    pub fn new(
        store: Arc<SubscriptionStore>,
        adapter: Arc<dyn SourceAdapter>,
        notifier: Notifier,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            adapter,
            notifier,
            config,
            cooldowns: Mutex::new(HashMap::new()),
            auth_halted: AtomicBool::new(false),
        }
    }

    pub fn is_halted(&self) -> bool {
        self.auth_halted.load(Ordering::SeqCst)
    }

    /// Reload credentials and, if that works, lift an auth halt.
    pub async fn refresh_and_resume(&self) -> Result<(), SourceError> {
        self.adapter.refresh_credentials().await?;
        if self.auth_halted.swap(false, Ordering::SeqCst) {
            info!("credentials refreshed, polling resumed");
        }
        Ok(())
    }

    /// Tick until `shutdown` fires.  A tick in progress always runs to
    /// completion; cancellation is only observed between ticks and before
    /// each source's fetch.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            interval = ?self.config.interval,
            window = self.config.window,
            concurrency = self.config.concurrency,
            "poll scheduler started"
        );

        while !shutdown.is_cancelled() {
            let report = self.tick(&shutdown).await;
            if !report.halted {
                info!(
                    sources = report.outcomes.len(),
                    delivered = report.count(|o| matches!(o, PollOutcome::Delivered { .. })),
                    skipped = report.count(|o| !matches!(
                        o,
                        PollOutcome::Delivered { .. } | PollOutcome::Unchanged | PollOutcome::Checkpointed
                    )),
                    "tick complete"
                );
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }

        info!("poll scheduler stopped");
    }

    /// Run one tick over every subscription.
    pub async fn tick(&self, shutdown: &CancellationToken) -> TickReport {
        if self.is_halted() {
            error!("polling halted: API credentials rejected; replace them and send SIGHUP");
            return TickReport {
                halted: true,
                ..TickReport::default()
            };
        }

        let names: Vec<String> = self
            .store
            .list_all()
            .await
            .into_iter()
            .map(|sub| sub.source_name().to_string())
            .collect();

        let outcomes = stream::iter(names)
            .map(|name| async move {
                let outcome = self.poll_source(&name, shutdown).await;
                (name, outcome)
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect::<BTreeMap<_, _>>()
            .await;

        TickReport {
            outcomes,
            halted: false,
        }
    }

    fn should_stop(&self, shutdown: &CancellationToken) -> bool {
        shutdown.is_cancelled() || self.is_halted()
    }

    fn cooling_down(&self, name: &str) -> bool {
        let mut cooldowns = match self.cooldowns.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        match cooldowns.get(name) {
            Some(until) if Instant::now() < *until => true,
            Some(_) => {
                cooldowns.remove(name);
                false
            }
            None => false,
        }
    }

    fn start_cooldown(&self, name: &str, period: Duration) {
        let mut cooldowns = match self.cooldowns.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        cooldowns.insert(name.to_string(), Instant::now() + period);
    }

    #[instrument(skip_all, fields(source = %name))]
    async fn poll_source(&self, name: &str, shutdown: &CancellationToken) -> PollOutcome {
        if self.should_stop(shutdown) {
            return PollOutcome::Skipped;
        }
        if self.cooling_down(name) {
            debug!("rate-limit cooldown in effect");
            return PollOutcome::CoolingDown;
        }

        let _guard = self.store.lock_source(name).await;
        // Waiting for the lock may have taken a while.
        if self.should_stop(shutdown) {
            return PollOutcome::Skipped;
        }
        let Some(sub) = self.store.get(name).await else {
            return PollOutcome::Skipped;
        };

        debug!(phase = ?Phase::Fetching, "phase");
        let handle = match sub.handle() {
            Some(handle) => handle.clone(),
            None => match self.resolve(name).await {
                Ok(handle) => handle,
                Err(e) => return self.on_error(name, e).await,
            },
        };
        let window = match retry_transient(self.config.retry, || {
            self.adapter.fetch_recent(name, &handle, self.config.window)
        })
        .await
        {
            Ok(window) => window,
            Err(e) => return self.on_error(name, e).await,
        };

        debug!(phase = ?Phase::Diffing, fetched = window.len(), "phase");
        let d = diff(sub.cursor(), &window);
        if d.gap {
            warn!(
                cursor = sub.cursor().unwrap_or_default(),
                oldest = window.last().map(|i| i.id.as_str()).unwrap_or_default(),
                "cursor fell out of the window; items in between were skipped"
            );
        }

        debug!(phase = ?Phase::Delivering, new = d.new_items.len(), "phase");
        // Re-read consumers so an unsubscribe during the fetch is honoured.
        let consumers = self.store.consumers_of(name).await;
        if consumers.is_empty() {
            return PollOutcome::Skipped;
        }
        let totals = self.notifier.fan_out(name, &d.new_items, consumers.iter()).await;

        debug!(phase = ?Phase::Committing, "phase");
        if let Some(cursor) = d.new_cursor.as_deref().filter(|c| Some(*c) != sub.cursor()) {
            if let Err(e) = self.store.advance_cursor(name, cursor).await {
                error!(error = %e, cursor, "failed to persist cursor; items will be re-delivered");
                return PollOutcome::CommitFailed;
            }
        }
        debug!(phase = ?Phase::Idle, "phase");

        if !d.new_items.is_empty() {
            PollOutcome::Delivered {
                items: d.new_items.len(),
                failed: totals.failed,
                gap: d.gap,
            }
        } else if sub.cursor().is_none() && d.new_cursor.is_some() {
            PollOutcome::Checkpointed
        } else {
            PollOutcome::Unchanged
        }
    }

    /// Resolve a name and cache the handle in the store.
    async fn resolve(&self, name: &str) -> Result<Handle, SourceError> {
        let handle = retry_transient(self.config.retry, || self.adapter.resolve(name)).await?;
        if let Err(e) = self.store.set_handle(name, Some(handle.clone())).await {
            // Only a cache; the next tick resolves again.
            warn!(error = %e, "failed to persist resolved handle");
        }
        Ok(handle)
    }

    async fn on_error(&self, name: &str, err: SourceError) -> PollOutcome {
        match err {
            SourceError::RateLimited { retry_after, .. } => {
                let period = retry_after.unwrap_or(self.config.default_cooldown);
                self.start_cooldown(name, period);
                warn!(cooldown = ?period, "rate limited; pausing this source");
                PollOutcome::RateLimited
            }
            SourceError::AuthExpired => {
                self.auth_halted.store(true, Ordering::SeqCst);
                error!("API credentials rejected; halting all polling until they are refreshed");
                PollOutcome::AuthExpired
            }
            SourceError::Transient { message, .. } => {
                warn!(error = %message, "transient failure; skipping until next tick");
                PollOutcome::Transient
            }
            SourceError::NotFound(_) => {
                warn!("source not found; will re-resolve next tick");
                if let Err(e) = self.store.set_handle(name, None).await {
                    warn!(error = %e, "failed to clear cached handle");
                }
                PollOutcome::NotFound
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::Notifier;
    use crate::store::{ConsumerId, Persistence};
    use crate::testing::{FakeAdapter, MemoryPersistence, RecordingTransport};
    use crate::tracker::{Subscribed, Tracker};

    struct Harness {
        persistence: Arc<MemoryPersistence>,
        store: Arc<SubscriptionStore>,
        adapter: Arc<FakeAdapter>,
        transport: Arc<RecordingTransport>,
        scheduler: PollScheduler,
    }

    fn config(concurrency: usize) -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_secs(3600),
            window: 10,
            concurrency,
            default_cooldown: Duration::from_secs(900),
            retry: RetryConfig::IMMEDIATE,
        }
    }

    async fn harness_with(persistence: Arc<MemoryPersistence>, concurrency: usize) -> Harness {
        let store = Arc::new(SubscriptionStore::open(persistence.clone()).await.unwrap());
        let adapter = Arc::new(FakeAdapter::default());
        let transport = Arc::new(RecordingTransport::default());
        let scheduler = PollScheduler::new(
            store.clone(),
            adapter.clone(),
            Notifier::new(transport.clone()),
            config(concurrency),
        );
        Harness {
            persistence,
            store,
            adapter,
            transport,
            scheduler,
        }
    }

    async fn harness() -> Harness {
        harness_with(Arc::new(MemoryPersistence::default()), 4).await
    }

    fn c(id: &str) -> ConsumerId {
        ConsumerId(id.to_string())
    }

    /// Track `name` for `consumers` with the cursor at `cursor`.
    async fn track(h: &Harness, name: &str, cursor: Option<&str>, consumers: &[&str]) {
        for consumer in consumers {
            h.store.upsert(name, &c(consumer)).await.unwrap();
        }
        if let Some(cursor) = cursor {
            h.store.advance_cursor(name, cursor).await.unwrap();
        }
    }

    /// Ids delivered to one consumer, in order.
    fn delivered_ids(h: &Harness, consumer: &str) -> Vec<String> {
        h.transport
            .sent_to(&c(consumer))
            .iter()
            .map(|text| text.rsplit('/').next().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn distinct_sources_are_fetched_at_most_concurrency_at_once() {
        let h = harness_with(Arc::new(MemoryPersistence::default()), 2).await;
        for name in ["a", "b", "c"] {
            track(&h, name, Some("1"), &["1"]).await;
            h.adapter.set_window(name, &["2", "1"]);
        }
        h.adapter.set_fetch_delay(Duration::from_millis(20));

        let report = h.scheduler.tick(&CancellationToken::new()).await;

        assert_eq!(h.adapter.peak_fetches(), 2);
        for name in ["a", "b", "c"] {
            assert_eq!(h.adapter.fetch_count(name), 1);
            assert!(matches!(report.outcomes[name], PollOutcome::Delivered { items: 1, .. }));
        }
    }

    #[tokio::test]
    async fn seeding_subscribe_waits_for_the_poll_of_the_same_source() {
        let h = harness().await;
        track(&h, "a", Some("1"), &["1"]).await;
        h.adapter.set_window("a", &["2", "1"]);
        h.adapter.set_fetch_delay(Duration::from_millis(30));
        let tracker = Tracker::new(h.store.clone(), h.adapter.clone(), 10);
        let shutdown = CancellationToken::new();

        let (report, subscribed) = tokio::join!(h.scheduler.tick(&shutdown), async {
            // Let the poll take the source lock first.
            tokio::time::sleep(Duration::from_millis(5)).await;
            tracker.subscribe(&c("2"), "a").await
        });

        assert_eq!(h.adapter.peak_fetches(), 1, "fetches of one source overlapped");
        assert_eq!(h.adapter.fetch_count("a"), 2);
        assert_eq!(
            report.outcomes["a"],
            PollOutcome::Delivered { items: 1, failed: 0, gap: false }
        );
        assert_eq!(delivered_ids(&h, "1"), ["2"]);
        // The newcomer only sees its baseline, not the poll's fan-out.
        assert!(delivered_ids(&h, "2").is_empty());
        assert!(matches!(subscribed, Ok(Subscribed::Created { ref baseline, .. }) if baseline.len() == 2));
        assert_eq!(h.store.get("a").await.unwrap().cursor(), Some("2"));
    }

    #[tokio::test]
    async fn shared_source_is_fetched_once_per_tick() {
        let h = harness().await;
        track(&h, "a", Some("1"), &["1", "2", "3"]).await;
        h.adapter.set_window("a", &["3", "2", "1"]);

        let report = h.scheduler.tick(&CancellationToken::new()).await;

        assert_eq!(h.adapter.fetch_count("a"), 1);
        assert_eq!(
            report.outcomes["a"],
            PollOutcome::Delivered { items: 2, failed: 0, gap: false }
        );
        for consumer in ["1", "2", "3"] {
            assert_eq!(delivered_ids(&h, consumer), ["2", "3"]);
        }
    }

    #[tokio::test]
    async fn delivers_chronologically_then_persists_cursor() {
        let h = harness().await;
        track(&h, "a", Some("5"), &["1", "2"]).await;
        h.adapter.set_window("a", &["8", "7", "6", "5"]);

        h.scheduler.tick(&CancellationToken::new()).await;

        assert_eq!(delivered_ids(&h, "1"), ["6", "7", "8"]);
        assert_eq!(delivered_ids(&h, "2"), ["6", "7", "8"]);
        let saved = h.persistence.last_saved().unwrap();
        assert_eq!(saved.subscriptions[0].cursor(), Some("8"));

        // Nothing new on the next tick.
        let report = h.scheduler.tick(&CancellationToken::new()).await;
        assert_eq!(report.outcomes["a"], PollOutcome::Unchanged);
        assert_eq!(delivered_ids(&h, "1").len(), 3);
    }

    /// A crash after delivery but before the cursor reaches disk must lead to
    /// duplicates on restart, never to lost items.
    #[tokio::test]
    async fn crash_between_delivery_and_commit_redelivers() {
        let h = harness().await;
        track(&h, "a", Some("5"), &["1"]).await;
        h.adapter.set_window("a", &["8", "7", "6", "5"]);

        // The commit never reaches disk.
        h.persistence.set_fail_saves(true);
        let report = h.scheduler.tick(&CancellationToken::new()).await;
        assert_eq!(report.outcomes["a"], PollOutcome::CommitFailed);
        assert_eq!(delivered_ids(&h, "1"), ["6", "7", "8"]);
        h.persistence.set_fail_saves(false);

        // Restart from what is on disk.
        let restarted = harness_with(h.persistence.clone(), 4).await;
        assert_eq!(restarted.store.get("a").await.unwrap().cursor(), Some("5"));
        restarted.adapter.set_window("a", &["8", "7", "6", "5"]);

        restarted.scheduler.tick(&CancellationToken::new()).await;

        assert_eq!(delivered_ids(&restarted, "1"), ["6", "7", "8"], "duplicate, not loss");
        assert_eq!(restarted.store.get("a").await.unwrap().cursor(), Some("8"));
    }

    #[tokio::test]
    async fn first_observation_checkpoints_silently() {
        let h = harness().await;
        track(&h, "a", None, &["1"]).await;
        h.adapter.set_window("a", &["3", "2", "1"]);

        let report = h.scheduler.tick(&CancellationToken::new()).await;

        assert_eq!(report.outcomes["a"], PollOutcome::Checkpointed);
        assert!(h.transport.sent().is_empty());
        assert_eq!(h.store.get("a").await.unwrap().cursor(), Some("3"));
    }

    #[tokio::test]
    async fn gap_delivers_whole_window() {
        let h = harness().await;
        track(&h, "a", Some("2"), &["1"]).await;
        h.adapter.set_window("a", &["9", "8", "7"]);

        let report = h.scheduler.tick(&CancellationToken::new()).await;

        assert_eq!(
            report.outcomes["a"],
            PollOutcome::Delivered { items: 3, failed: 0, gap: true }
        );
        assert_eq!(delivered_ids(&h, "1"), ["7", "8", "9"]);
        assert_eq!(h.store.get("a").await.unwrap().cursor(), Some("9"));
    }

    #[tokio::test]
    async fn empty_window_leaves_cursor() {
        let h = harness().await;
        track(&h, "a", Some("5"), &["1"]).await;
        h.adapter.set_window("a", &[]);

        let report = h.scheduler.tick(&CancellationToken::new()).await;

        assert_eq!(report.outcomes["a"], PollOutcome::Unchanged);
        assert_eq!(h.store.get("a").await.unwrap().cursor(), Some("5"));
    }

    #[tokio::test]
    async fn delivery_failure_still_advances_cursor() {
        let h = harness().await;
        track(&h, "a", Some("1"), &["bad", "good"]).await;
        h.adapter.set_window("a", &["3", "2", "1"]);
        h.transport.fail_for(&c("bad"));

        let report = h.scheduler.tick(&CancellationToken::new()).await;

        assert_eq!(
            report.outcomes["a"],
            PollOutcome::Delivered { items: 2, failed: 2, gap: false }
        );
        assert_eq!(delivered_ids(&h, "good"), ["2", "3"]);
        assert_eq!(h.store.get("a").await.unwrap().cursor(), Some("3"));
    }

    #[tokio::test]
    async fn rate_limit_on_one_source_does_not_affect_another() {
        let h = harness().await;
        track(&h, "a", Some("1"), &["1"]).await;
        track(&h, "b", Some("1"), &["2"]).await;
        h.adapter.set_window("a", &["2", "1"]);
        h.adapter.set_window("b", &["2", "1"]);
        h.adapter.fail_next(
            "a",
            SourceError::RateLimited {
                name: "a".into(),
                retry_after: Some(Duration::from_secs(600)),
            },
        );

        let report = h.scheduler.tick(&CancellationToken::new()).await;
        assert_eq!(report.outcomes["a"], PollOutcome::RateLimited);
        assert!(matches!(report.outcomes["b"], PollOutcome::Delivered { .. }));
        assert_eq!(h.store.get("a").await.unwrap().cursor(), Some("1"));

        // Still cooling down: not even fetched.
        let report = h.scheduler.tick(&CancellationToken::new()).await;
        assert_eq!(report.outcomes["a"], PollOutcome::CoolingDown);
        assert_eq!(h.adapter.fetch_count("a"), 1);
        assert_eq!(h.adapter.fetch_count("b"), 2);
    }

    #[tokio::test]
    async fn expired_cooldown_polls_again() {
        let h = harness().await;
        track(&h, "a", Some("1"), &["1"]).await;
        h.adapter.set_window("a", &["2", "1"]);
        h.adapter.fail_next(
            "a",
            SourceError::RateLimited {
                name: "a".into(),
                retry_after: Some(Duration::ZERO),
            },
        );

        h.scheduler.tick(&CancellationToken::new()).await;
        let report = h.scheduler.tick(&CancellationToken::new()).await;

        assert!(matches!(report.outcomes["a"], PollOutcome::Delivered { .. }));
        assert_eq!(h.adapter.fetch_count("a"), 2);
    }

    #[tokio::test]
    async fn auth_expiry_halts_everything_until_resumed() {
        // One at a time, so "a" is polled first and the rest are not started.
        let h = harness_with(Arc::new(MemoryPersistence::default()), 1).await;
        for name in ["a", "b", "c"] {
            track(&h, name, Some("1"), &["1"]).await;
            h.adapter.set_window(name, &["2", "1"]);
        }
        h.adapter.fail_next("a", SourceError::AuthExpired);

        let report = h.scheduler.tick(&CancellationToken::new()).await;

        assert_eq!(report.outcomes["a"], PollOutcome::AuthExpired);
        assert_eq!(report.outcomes["b"], PollOutcome::Skipped);
        assert_eq!(report.outcomes["c"], PollOutcome::Skipped);
        assert!(h.scheduler.is_halted());
        for name in ["b", "c"] {
            assert_eq!(h.adapter.fetch_count(name), 0);
            assert_eq!(h.store.get(name).await.unwrap().cursor(), Some("1"));
        }

        let report = h.scheduler.tick(&CancellationToken::new()).await;
        assert!(report.halted);
        assert_eq!(h.adapter.fetch_count("a"), 1);

        h.scheduler.refresh_and_resume().await.unwrap();
        assert_eq!(h.adapter.refresh_count(), 1);
        assert!(!h.scheduler.is_halted());

        let report = h.scheduler.tick(&CancellationToken::new()).await;
        for name in ["a", "b", "c"] {
            assert!(matches!(report.outcomes[name], PollOutcome::Delivered { .. }));
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_within_the_tick() {
        let h = harness().await;
        track(&h, "a", Some("1"), &["1"]).await;
        h.adapter.set_window("a", &["2", "1"]);
        h.adapter.fail_next("a", SourceError::transient("a", "502"));
        h.adapter.fail_next("a", SourceError::transient("a", "timeout"));

        let report = h.scheduler.tick(&CancellationToken::new()).await;

        assert!(matches!(report.outcomes["a"], PollOutcome::Delivered { .. }));
        assert_eq!(h.adapter.fetch_count("a"), 3);
    }

    #[tokio::test]
    async fn exhausted_transient_skips_until_next_tick() {
        let h = harness().await;
        track(&h, "a", Some("1"), &["1"]).await;
        h.adapter.set_window("a", &["2", "1"]);
        for _ in 0..3 {
            h.adapter.fail_next("a", SourceError::transient("a", "503"));
        }

        let report = h.scheduler.tick(&CancellationToken::new()).await;
        assert_eq!(report.outcomes["a"], PollOutcome::Transient);
        assert_eq!(h.store.get("a").await.unwrap().cursor(), Some("1"));

        let report = h.scheduler.tick(&CancellationToken::new()).await;
        assert!(matches!(report.outcomes["a"], PollOutcome::Delivered { .. }));
    }

    #[tokio::test]
    async fn handle_is_resolved_once_and_cached() {
        let h = harness().await;
        track(&h, "a", Some("1"), &["1"]).await;
        h.adapter.set_window("a", &["1"]);

        h.scheduler.tick(&CancellationToken::new()).await;
        h.scheduler.tick(&CancellationToken::new()).await;

        assert_eq!(h.adapter.resolve_count("a"), 1);
        assert_eq!(h.adapter.fetch_count("a"), 2);
        let saved = h.persistence.load().await.unwrap();
        assert!(saved.subscriptions[0].handle().is_some());
    }

    #[tokio::test]
    async fn vanished_source_is_reported_not_found() {
        let h = harness().await;
        track(&h, "gone", Some("1"), &["1"]).await;
        h.adapter.mark_missing("gone");

        let report = h.scheduler.tick(&CancellationToken::new()).await;

        assert_eq!(report.outcomes["gone"], PollOutcome::NotFound);
        assert_eq!(h.adapter.fetch_count("gone"), 0);
        assert!(h.store.get("gone").await.is_some(), "subscriptions are never dropped by polling");
    }

    #[tokio::test]
    async fn cancelled_token_skips_every_source() {
        let h = harness().await;
        track(&h, "a", Some("1"), &["1"]).await;
        h.adapter.set_window("a", &["2", "1"]);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let report = h.scheduler.tick(&shutdown).await;

        assert_eq!(report.outcomes["a"], PollOutcome::Skipped);
        assert_eq!(h.adapter.fetch_count("a"), 0);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_after_finishing_the_tick() {
        let h = Arc::new(harness().await);
        track(&h, "a", Some("1"), &["1"]).await;
        h.adapter.set_window("a", &["2", "1"]);
        let shutdown = CancellationToken::new();

        let task = {
            let h = Arc::clone(&h);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { h.scheduler.run(shutdown).await })
        };

        // Wait for the first tick to deliver, then cancel during the sleep.
        while h.transport.sent().is_empty() {
            tokio::task::yield_now().await;
        }
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("scheduler did not stop")
            .unwrap();

        assert_eq!(h.store.get("a").await.unwrap().cursor(), Some("2"));
        assert_eq!(h.adapter.fetch_count("a"), 1);
    }
}
