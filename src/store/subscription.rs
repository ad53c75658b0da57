//! The per-source subscription record.
//!
//! A [`Subscription`] can only be built with at least one consumer, and the
//! mutation that would remove the last one reports [`Removal::Emptied`] so the
//! store deletes the record instead of keeping an empty shell around.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::source::Handle;

/// Opaque delivery destination (a chat id for the Telegram front-end).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsumerId(pub String);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for ConsumerId {
    fn from(id: i64) -> Self {
        ConsumerId(id.to_string())
    }
}

/// Normalize user input into a source key: strip one leading `@`, trim,
/// case-fold.
///
/// Returns `None` for input that cannot name an account (empty, or
/// containing whitespace or a path separator).
pub fn normalize_source(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let name = trimmed.strip_prefix('@').unwrap_or(trimmed);
    if name.is_empty() || name.chars().any(|c| c.is_whitespace() || c == '/' || c == '@') {
        return None;
    }
    Some(name.to_lowercase())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The consumer was not subscribed.
    Absent,
    /// Removed; other consumers remain.
    Kept,
    /// Removed the last consumer.  The caller must drop the subscription.
    Emptied,
}

/// One tracked source: its resolved handle, delivery cursor, and the set of
/// consumers following it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    source_name: String,
    #[serde(default)]
    source_handle: Option<Handle>,
    #[serde(default)]
    cursor: Option<String>,
    consumers: BTreeSet<ConsumerId>,
}

impl Subscription {
    pub fn new(source_name: impl Into<String>, first: ConsumerId) -> Self {
        Self {
            source_name: source_name.into(),
            source_handle: None,
            cursor: None,
            consumers: BTreeSet::from([first]),
        }
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn handle(&self) -> Option<&Handle> {
        self.source_handle.as_ref()
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn consumers(&self) -> &BTreeSet<ConsumerId> {
        &self.consumers
    }

    pub fn has_consumer(&self, consumer: &ConsumerId) -> bool {
        self.consumers.contains(consumer)
    }

    /// Returns `true` if the consumer was newly added.
    pub fn add_consumer(&mut self, consumer: ConsumerId) -> bool {
        self.consumers.insert(consumer)
    }

    pub fn remove_consumer(&mut self, consumer: &ConsumerId) -> Removal {
        if !self.consumers.remove(consumer) {
            Removal::Absent
        } else if self.consumers.is_empty() {
            Removal::Emptied
        } else {
            Removal::Kept
        }
    }

    pub fn set_cursor(&mut self, cursor: Option<String>) {
        self.cursor = cursor;
    }

    pub fn set_handle(&mut self, handle: Option<Handle>) {
        self.source_handle = handle;
    }

    /// Records loaded from disk bypass the constructor, so the store checks
    /// this before admitting them.
    pub(crate) fn is_valid(&self) -> bool {
        !self.consumers.is_empty()
            && normalize_source(&self.source_name).as_deref() == Some(self.source_name.as_str())
    }
}
