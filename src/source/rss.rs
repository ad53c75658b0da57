//! RSS account-feed adapter.
//!
//! Many mirrors expose each account as an RSS 2.0 feed at
//! `{base}/{name}/rss`.  This adapter resolves a name by fetching that feed
//! once and then polls it on every tick.  The feed URL is always rebuilt
//! from the current root and the source name, so a stored handle survives a
//! change of root or of backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::http::{build_client, classify_status, classify_transport};
use super::{newest_first, Handle, Item, SourceAdapter};
use crate::error::SourceError;

/// An RSS-backed source adapter.
pub struct RssAdapter {
    client: reqwest::Client,
    /// Feed root, without a trailing slash.
    base: String,
}

impl RssAdapter {
    /// Create an adapter rooted at `base` (e.g. `https://nitter.example`).
    pub fn new(base: impl Into<String>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_client()?,
            base: base.into().trim_end_matches('/').to_string(),
        })
    }

    fn feed_url(&self, name: &str) -> String {
        format!("{}/{name}/rss", self.base)
    }

    async fn get_body(&self, name: &str, url: &str) -> Result<Vec<u8>, SourceError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify_transport(name, &e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(classify_status(name, status, resp.headers(), Utc::now()));
        }

        let body = resp.bytes().await.map_err(|e| classify_transport(name, &e))?;
        Ok(body.to_vec())
    }

    /// Parse an already-fetched [`rss::Channel`] into a newest-first window.
    ///
    /// Pure so that tests can exercise it without the network.
    pub fn parse_channel(channel: &rss::Channel, window: usize) -> Vec<Item> {
        let mut items: Vec<Item> = channel
            .items()
            .iter()
            .filter_map(|item| {
                // Prefer <guid>, fall back to <link>; an item with neither
                // can never match a cursor, so drop it.
                let id = item
                    .guid()
                    .map(|g| g.value().to_string())
                    .or_else(|| item.link().map(String::from))?;

                let timestamp = item
                    .pub_date()
                    .and_then(|d| DateTime::parse_from_rfc2822(d).ok())
                    .map(|dt| dt.with_timezone(&Utc));

                let body = item
                    .title()
                    .or_else(|| item.description())
                    .unwrap_or("(untitled)")
                    .to_string();

                Some(Item {
                    permalink: item.link().map(String::from).unwrap_or_else(|| id.clone()),
                    id,
                    timestamp,
                    body,
                })
            })
            .collect();

        items.sort_by(newest_first);
        items.truncate(window);
        items
    }
}

#[async_trait]
impl SourceAdapter for RssAdapter {
    fn label(&self) -> &str {
        "rss"
    }

    async fn resolve(&self, name: &str) -> Result<Handle, SourceError> {
        let url = self.feed_url(name);
        let body = self.get_body(name, &url).await?;
        // A page that is not a feed is not an account.
        rss::Channel::read_from(body.as_slice())
            .map_err(|_| SourceError::NotFound(name.to_string()))?;
        Ok(Handle(name.to_string()))
    }

    async fn fetch_recent(
        &self,
        name: &str,
        _handle: &Handle,
        window: usize,
    ) -> Result<Vec<Item>, SourceError> {
        let body = self.get_body(name, &self.feed_url(name)).await?;
        let channel = rss::Channel::read_from(body.as_slice())
            .map_err(|e| SourceError::transient(name, format!("malformed feed: {e}")))?;
        Ok(Self::parse_channel(&channel, window))
    }
}
