//! HTTP failure classification shared by the adapters.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;

use crate::error::SourceError;

/// Upper bound on a single request.  Fetches are never cancelled mid-flight,
/// so this is the longest a shutdown can wait on one source.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

pub fn build_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .user_agent(concat!("feedwatch/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Map a non-success HTTP status onto the error taxonomy.
///
/// 400 is folded into `NotFound`: the providers answer it for names that
/// cannot be accounts at all.
pub fn classify_status(
    name: &str,
    status: StatusCode,
    headers: &HeaderMap,
    now: DateTime<Utc>,
) -> SourceError {
    match status.as_u16() {
        401 | 403 => SourceError::AuthExpired,
        400 | 404 | 410 => SourceError::NotFound(name.to_string()),
        429 => SourceError::RateLimited {
            name: name.to_string(),
            retry_after: retry_after(headers, now),
        },
        _ => SourceError::transient(name, format!("HTTP {status}")),
    }
}

/// Every transport-level failure (timeout, refused connection, truncated
/// body) is worth another attempt.
pub fn classify_transport(name: &str, err: &reqwest::Error) -> SourceError {
    let message = if err.is_timeout() {
        "request timed out".to_string()
    } else {
        err.to_string()
    };
    SourceError::transient(name, message)
}

/// Read the provider's back-off hint.
///
/// `retry-after` (seconds) wins; otherwise `x-rate-limit-reset` is an epoch
/// timestamp at which the window reopens.
fn retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let header = |key: &str| {
        headers
            .get(key)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
    };

    if let Some(secs) = header("retry-after") {
        return u64::try_from(secs).ok().map(Duration::from_secs);
    }

    let reset = header("x-rate-limit-reset")?;
    let remaining = reset - now.timestamp();
    Some(Duration::from_secs(u64::try_from(remaining).unwrap_or(0)))
}
