//! Bot API client: long-polls for incoming messages and sends replies.
//!
//! The token is part of every URL, so URLs are never logged.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::TransportError;
use crate::notify::Transport;
use crate::store::ConsumerId;

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// How long the server may hold a `getUpdates` call open.
pub const LONG_POLL: Duration = Duration::from_secs(25);

pub struct TelegramClient {
    client: reqwest::Client,
    base: String,
}

impl TelegramClient {
    pub fn new(api_base: &str, token: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(LONG_POLL + Duration::from_secs(10))
            .user_agent(concat!("feedwatch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base: format!("{}/bot{token}", api_base.trim_end_matches('/')),
        })
    }

    async fn call<B: Serialize, T: DeserializeOwned>(
        &self,
        method: &str,
        body: &B,
    ) -> Result<T, TransportError> {
        let resp = self
            .client
            .post(format!("{}/{method}", self.base))
            .json(body)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.without_url()))?;
        let status = resp.status();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| TransportError::Http(e.without_url()))?;
        debug!(method, %status, len = bytes.len(), "bot api call");
        decode(&bytes)
    }

    /// Fetch messages after `offset`, waiting up to [`LONG_POLL`] for one.
    pub async fn get_updates(&self, offset: i64) -> Result<Vec<Update>, TransportError> {
        #[derive(Serialize)]
        struct GetUpdates<'a> {
            offset: i64,
            timeout: u64,
            allowed_updates: &'a [&'a str],
        }
        self.call(
            "getUpdates",
            &GetUpdates {
                offset,
                timeout: LONG_POLL.as_secs(),
                allowed_updates: &["message"],
            },
        )
        .await
    }

    pub async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), TransportError> {
        #[derive(Serialize)]
        struct SendMessage<'a> {
            chat_id: &'a str,
            text: &'a str,
        }
        let _: serde_json::Value = self.call("sendMessage", &SendMessage { chat_id, text }).await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for TelegramClient {
    async fn send(&self, consumer: &ConsumerId, text: &str) -> Result<(), TransportError> {
        self.send_message(&consumer.0, text).await
    }
}

// ---------------------------------------------------------------------------
// Wire payloads
// ---------------------------------------------------------------------------

/// Every response is wrapped as `{"ok": bool, "result": ..., "description": ...}`,
/// including errors, which also carry a non-2xx status.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, TransportError> {
    let envelope: Envelope<T> = serde_json::from_slice(body)
        .map_err(|e| TransportError::Rejected(format!("malformed response: {e}")))?;
    match (envelope.ok, envelope.result) {
        (true, Some(result)) => Ok(result),
        _ => Err(TransportError::Rejected(
            envelope
                .description
                .unwrap_or_else(|| "request failed without description".to_string()),
        )),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub chat: Chat,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

impl Update {
    /// The sending chat and its text, for text messages only.
    pub fn text_message(self) -> Option<(ConsumerId, String)> {
        let message = self.message?;
        let text = message.text?;
        Some((ConsumerId::from(message.chat.id), text))
    }
}
