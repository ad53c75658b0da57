//! In-memory fakes for the collaborator seams, shared by unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{SourceError, StoreError, TransportError};
use crate::notify::Transport;
use crate::source::{Handle, Item, SourceAdapter};
use crate::store::{ConsumerId, Persistence, Snapshot};

/// Keeps the last saved snapshot in memory and can simulate a failing disk.
#[derive(Default)]
pub struct MemoryPersistence {
    saved: Mutex<Option<Snapshot>>,
    fail_saves: Mutex<bool>,
}

impl MemoryPersistence {
    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            saved: Mutex::new(Some(snapshot)),
            fail_saves: Mutex::new(false),
        }
    }

    pub fn set_fail_saves(&self, fail: bool) {
        *self.fail_saves.lock().unwrap() = fail;
    }

    pub fn last_saved(&self) -> Option<Snapshot> {
        self.saved.lock().unwrap().clone()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn load(&self) -> Result<Snapshot, StoreError> {
        Ok(self.last_saved().unwrap_or_else(Snapshot::empty))
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        if *self.fail_saves.lock().unwrap() {
            return Err(io::Error::other("disk full").into());
        }
        *self.saved.lock().unwrap() = Some(snapshot.clone());
        Ok(())
    }
}

pub fn item(id: &str) -> Item {
    Item {
        id: id.to_string(),
        timestamp: None,
        body: format!("post {id}"),
        permalink: format!("https://example.com/status/{id}"),
    }
}

/// Newest-first window from ids.
pub fn window(ids: &[&str]) -> Vec<Item> {
    ids.iter().map(|id| item(id)).collect()
}

/// Scripted source adapter.
///
/// Each source has a current window; one-shot failures can be queued ahead
/// of it.  Every call is counted.  With a fetch delay set, each fetch sleeps
/// so overlapping fetches can be observed through [`FakeAdapter::peak_fetches`].
#[derive(Default)]
pub struct FakeAdapter {
    windows: Mutex<HashMap<String, Vec<Item>>>,
    failures: Mutex<HashMap<String, VecDeque<SourceError>>>,
    missing: Mutex<HashSet<String>>,
    fetches: Mutex<HashMap<String, usize>>,
    resolves: Mutex<HashMap<String, usize>>,
    refreshes: Mutex<usize>,
    fetch_delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeAdapter {
    pub fn set_window(&self, name: &str, ids: &[&str]) {
        self.windows
            .lock()
            .unwrap()
            .insert(name.to_string(), window(ids));
    }

    pub fn fail_next(&self, name: &str, err: SourceError) {
        self.failures
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .push_back(err);
    }

    pub fn mark_missing(&self, name: &str) {
        self.missing.lock().unwrap().insert(name.to_string());
    }

    pub fn fetch_count(&self, name: &str) -> usize {
        self.fetches.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub fn resolve_count(&self, name: &str) -> usize {
        self.resolves.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub fn refresh_count(&self) -> usize {
        *self.refreshes.lock().unwrap()
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = delay;
    }

    /// Most fetches ever running at the same time.
    pub fn peak_fetches(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceAdapter for FakeAdapter {
    fn label(&self) -> &str {
        "fake"
    }

    async fn resolve(&self, name: &str) -> Result<Handle, SourceError> {
        *self
            .resolves
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default() += 1;
        if self.missing.lock().unwrap().contains(name) {
            return Err(SourceError::NotFound(name.to_string()));
        }
        Ok(Handle(format!("handle-{name}")))
    }

    async fn fetch_recent(
        &self,
        name: &str,
        handle: &Handle,
        window: usize,
    ) -> Result<Vec<Item>, SourceError> {
        assert_eq!(handle.0, format!("handle-{name}"), "fetched with a foreign handle");
        *self
            .fetches
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default() += 1;

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        let delay = *self.fetch_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(err) = self
            .failures
            .lock()
            .unwrap()
            .get_mut(name)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        let mut items = self
            .windows
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default();
        items.truncate(window);
        Ok(items)
    }

    async fn refresh_credentials(&self) -> Result<(), SourceError> {
        *self.refreshes.lock().unwrap() += 1;
        Ok(())
    }
}

/// Transport that records every message and can reject chosen consumers.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(ConsumerId, String)>>,
    failing: Mutex<HashSet<ConsumerId>>,
}

impl RecordingTransport {
    pub fn fail_for(&self, consumer: &ConsumerId) {
        self.failing.lock().unwrap().insert(consumer.clone());
    }

    pub fn sent(&self) -> Vec<(ConsumerId, String)> {
        self.sent.lock().unwrap().clone()
    }

    /// Messages delivered to one consumer, in order.
    pub fn sent_to(&self, consumer: &ConsumerId) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|(c, _)| c == consumer)
            .map(|(_, text)| text)
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, consumer: &ConsumerId, text: &str) -> Result<(), TransportError> {
        if self.failing.lock().unwrap().contains(consumer) {
            return Err(TransportError::Rejected(format!("chat {consumer} blocked the bot")));
        }
        self.sent
            .lock()
            .unwrap()
            .push((consumer.clone(), text.to_string()));
        Ok(())
    }
}
