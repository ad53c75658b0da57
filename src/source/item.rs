//! The content unit shared across all source adapters.
//!
//! Every adapter converts its native payload into [`Item`]s so the diff and
//! delivery layers stay source-agnostic.  Items are never persisted; only the
//! id of the newest one survives, as a subscription's cursor.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

/// A single post fetched from a source.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Item {
    /// Opaque identifier, unique within its source.
    ///
    /// Only ever compared for equality against a cursor.  Nothing assumes
    /// ids are numeric or sortable.
    pub id: String,

    /// Publication timestamp, when the source provides one.  Display only.
    pub timestamp: Option<DateTime<Utc>>,

    /// Post text.
    pub body: String,

    /// Public URL of the post.
    pub permalink: String,
}

/// Comparator for newest-first ordering.  Undated items sink to the end.
///
/// Adapters whose upstream does not guarantee ordering (RSS) use this to
/// honour the newest-first window contract.
pub fn newest_first(a: &Item, b: &Item) -> Ordering {
    // `None < Some(_)`, so comparing `b` to `a` puts dated items first.
    b.timestamp.cmp(&a.timestamp)
}
