//! Source adapter abstraction layer.
//!
//! This module defines the [`SourceAdapter`] trait and the common [`Item`]
//! type.  Concrete adapters live in sub-modules:
//!
//! * [`x`] — the JSON timeline API, authenticated with a bearer token.
//! * [`rss`] — per-account RSS feeds under a configurable root.
//!
//! Adapters report every failure as a classified [`SourceError`]; the shared
//! status-code mapping lives in [`http`].
//!
//! ## Adding a new adapter
//!
//! 1. Create a new file in this directory.
//! 2. Implement [`SourceAdapter`] for your struct, mapping upstream failures
//!    through [`http::classify_status`] / [`http::classify_transport`] or
//!    your own equivalent.
//! 3. Add the module below and a variant to [`crate::config::Backend`].

pub mod http;
mod item;
pub mod rss;
pub mod x;

pub use item::{newest_first, Item};
pub use rss::RssAdapter;
pub use x::XAdapter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SourceError;

/// Opaque token identifying a resolved source.
///
/// Persisted alongside the subscription so restarts skip re-resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(pub String);

/// Trait that every source backend must implement.
///
/// The scheduler calls [`fetch_recent`](SourceAdapter::fetch_recent) from
/// concurrent tasks, so implementations must be [`Send`] + [`Sync`].
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Short label used in logs.
    fn label(&self) -> &str;

    /// Resolve a normalized source name to a stable handle.
    ///
    /// Fails with [`SourceError::NotFound`] when the account does not exist.
    async fn resolve(&self, name: &str) -> Result<Handle, SourceError>;

    /// Fetch up to `window` of the source's most recent items, newest first.
    ///
    /// `name` is only used for permalinks and error context.
    async fn fetch_recent(
        &self,
        name: &str,
        handle: &Handle,
        window: usize,
    ) -> Result<Vec<Item>, SourceError>;

    /// Reload credentials after the operator has replaced them.
    async fn refresh_credentials(&self) -> Result<(), SourceError> {
        Ok(())
    }
}
