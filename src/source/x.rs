//! Timeline API adapter.
//!
//! Resolves account names through the user-lookup endpoint and reads each
//! account's recent posts from its timeline.  Requests carry a bearer token
//! which can be reloaded from a file at runtime (see
//! [`SourceAdapter::refresh_credentials`]).

use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info};

use super::http::{build_client, classify_status, classify_transport};
use super::{Handle, Item, SourceAdapter};
use crate::error::SourceError;

/// The timeline endpoint rejects page sizes outside this range.
const MIN_PAGE: usize = 5;
const MAX_PAGE: usize = 100;

pub struct XAdapter {
    client: reqwest::Client,
    api_base: String,
    token: RwLock<String>,
    token_file: Option<PathBuf>,
}

impl XAdapter {
    /// Create an adapter rooted at `api_base` (e.g. `https://api.twitter.com`).
    pub fn new(
        api_base: impl Into<String>,
        token: impl Into<String>,
        token_file: Option<PathBuf>,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_client()?,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: RwLock::new(token.into()),
            token_file,
        })
    }

    fn bearer(&self) -> String {
        match self.token.read() {
            Ok(token) => token.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, name: &str, url: &str) -> Result<T, SourceError> {
        debug!(source = %name, %url, "GET");
        let resp = self
            .client
            .get(url)
            .bearer_auth(self.bearer())
            .send()
            .await
            .map_err(|e| classify_transport(name, &e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(classify_status(name, status, resp.headers(), Utc::now()));
        }

        resp.json::<T>()
            .await
            .map_err(|e| classify_transport(name, &e))
    }
}

// ---------------------------------------------------------------------------
// Wire payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct UserLookup {
    data: Option<User>,
}

#[derive(Debug, Deserialize)]
struct User {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Timeline {
    #[serde(default)]
    data: Vec<Post>,
}

#[derive(Debug, Deserialize)]
struct Post {
    id: String,
    #[serde(default)]
    text: String,
    created_at: Option<DateTime<Utc>>,
}

/// Convert a timeline page into items, preserving the API's newest-first
/// order.
fn into_items(name: &str, timeline: Timeline, window: usize) -> Vec<Item> {
    timeline
        .data
        .into_iter()
        .take(window)
        .map(|post| Item {
            permalink: format!("https://twitter.com/{name}/status/{}", post.id),
            id: post.id,
            timestamp: post.created_at,
            body: post.text,
        })
        .collect()
}

#[async_trait]
impl SourceAdapter for XAdapter {
    fn label(&self) -> &str {
        "x"
    }

    async fn resolve(&self, name: &str) -> Result<Handle, SourceError> {
        let url = format!("{}/2/users/by/username/{name}", self.api_base);
        // Unknown users come back as 200 with an `errors` array and no data.
        let lookup: UserLookup = self.get_json(name, &url).await?;
        lookup
            .data
            .map(|user| Handle(user.id))
            .ok_or_else(|| SourceError::NotFound(name.to_string()))
    }

    async fn fetch_recent(
        &self,
        name: &str,
        handle: &Handle,
        window: usize,
    ) -> Result<Vec<Item>, SourceError> {
        let page = window.clamp(MIN_PAGE, MAX_PAGE);
        let url = format!(
            "{}/2/users/{}/tweets?max_results={page}&tweet.fields=created_at",
            self.api_base, handle.0
        );
        let timeline: Timeline = self.get_json(name, &url).await?;
        Ok(into_items(name, timeline, window))
    }

    async fn refresh_credentials(&self) -> Result<(), SourceError> {
        let Some(path) = &self.token_file else {
            return Ok(());
        };
        let token = tokio::fs::read_to_string(path)
            .await
            .map_err(|_| SourceError::AuthExpired)?;
        let token = token.trim().to_string();
        if token.is_empty() {
            return Err(SourceError::AuthExpired);
        }
        match self.token.write() {
            Ok(mut slot) => *slot = token,
            Err(poisoned) => *poisoned.into_inner() = token,
        }
        info!(path = %path.display(), "bearer token reloaded");
        Ok(())
    }
}
