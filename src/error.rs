//! Error types shared across the engine.
//!
//! [`SourceError`] is the closed taxonomy every source adapter reports.  The
//! scheduler and the command façade match on it exhaustively; nothing above
//! the adapter layer ever sees a raw HTTP or parse error.

use std::time::Duration;

use thiserror::Error;

/// Classified failure of a source adapter call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// The name does not correspond to a real account.
    #[error("source @{0} not found")]
    NotFound(String),

    /// The provider asked us to back off.  `retry_after` is the provider's
    /// hint, when it gave one.
    #[error("rate limited on @{name}")]
    RateLimited {
        name: String,
        retry_after: Option<Duration>,
    },

    /// Credentials were rejected.  Global, not scoped to any one source.
    #[error("API credentials rejected")]
    AuthExpired,

    /// Timeout, connection failure or 5xx.  Safe to retry.
    #[error("transient failure on @{name}: {message}")]
    Transient { name: String, message: String },
}

impl SourceError {
    pub fn transient(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Only transient failures are worth retrying inside a tick.
    pub fn is_retriable(&self) -> bool {
        matches!(self, SourceError::Transient { .. })
    }

    /// Terse text shown to a consumer in reply to an interactive command.
    pub fn user_message(&self) -> String {
        match self {
            SourceError::NotFound(name) => format!("@{name} was not found."),
            SourceError::RateLimited { .. } => {
                "The provider is rate limiting us, try again in a few minutes.".to_string()
            }
            SourceError::AuthExpired => {
                "The service is temporarily unavailable, the operator has been notified."
                    .to_string()
            }
            SourceError::Transient { name, .. } => {
                format!("Could not fetch posts from @{name} right now, try again later.")
            }
        }
    }
}

/// Failure to load or persist subscription state.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("schema version mismatch: expected {expected}, got {got}")]
    SchemaMismatch { expected: u32, got: u32 },

    #[error("persistence task failed: {0}")]
    Join(String),
}

/// Failure to hand a rendered message to the delivery channel.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Built with the URL stripped: bot API URLs carry the token.
    #[error("HTTP error: {0}")]
    Http(reqwest::Error),

    #[error("delivery rejected: {0}")]
    Rejected(String),
}
