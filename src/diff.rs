//! Cursor diffing.
//!
//! Given the newest-first window a source just returned and the id of the
//! newest item already delivered, work out what is new.  Pure: no I/O, no
//! clock, so the scheduler and the tests share one implementation.

use crate::source::Item;

/// Result of comparing a fetched window against a stored cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diff {
    /// Items to deliver, oldest first.
    pub new_items: Vec<Item>,
    /// Cursor to commit once delivery has been attempted.
    pub new_cursor: Option<String>,
    /// The stored cursor was not in the window, so some items between it and
    /// the oldest windowed item were skipped for good.
    pub gap: bool,
}

/// Compute the background-delivery diff.
///
/// * `cursor == None`: first observation.  Nothing is new; the newest item
///   becomes the checkpoint.
/// * cursor at position `k`: `window[..k]`, reversed.
/// * cursor absent: the whole window, reversed, flagged as a gap.
/// * empty window: nothing new, cursor unchanged.
pub fn diff(cursor: Option<&str>, window: &[Item]) -> Diff {
    let Some(newest) = window.first() else {
        return Diff {
            new_items: Vec::new(),
            new_cursor: cursor.map(String::from),
            gap: false,
        };
    };
    let new_cursor = Some(newest.id.clone());

    let Some(cursor) = cursor else {
        return Diff {
            new_items: Vec::new(),
            new_cursor,
            gap: false,
        };
    };

    let (fresh, gap) = match window.iter().position(|item| item.id == cursor) {
        Some(k) => (&window[..k], false),
        None => (window, true),
    };

    Diff {
        new_items: fresh.iter().rev().cloned().collect(),
        new_cursor,
        gap,
    }
}

/// One-time historical dump shown on interactive subscribe: the whole
/// window, oldest first.
pub fn baseline(window: &[Item]) -> Vec<Item> {
    window.iter().rev().cloned().collect()
}
