//! Runtime configuration, read from the environment.
//!
//! | Variable                  | Default                   |
//! |---------------------------|---------------------------|
//! | `TELEGRAM_TOKEN`          | required                  |
//! | `FEEDWATCH_BACKEND`       | `x`                       |
//! | `BEARER_TOKEN`            | required for `x`          |
//! | `BEARER_TOKEN_FILE`       | unset                     |
//! | `FEEDWATCH_API_BASE`      | `https://api.twitter.com` |
//! | `FEEDWATCH_RSS_BASE`      | required for `rss`        |
//! | `FEEDWATCH_STATE_FILE`    | `tracked_users.json`      |
//! | `FEEDWATCH_POLL_SECS`     | `60`                      |
//! | `FEEDWATCH_WINDOW`        | `10`                      |
//! | `FEEDWATCH_CONCURRENCY`   | `4`                       |
//! | `FEEDWATCH_COOLDOWN_SECS` | `900`                     |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::poll::SchedulerConfig;
use crate::retry::RetryConfig;

pub const DEFAULT_API_BASE: &str = "https://api.twitter.com";
pub const DEFAULT_STATE_FILE: &str = "tracked_users.json";
pub const DEFAULT_POLL_SECS: u64 = 60;
pub const DEFAULT_WINDOW: usize = 10;
pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_COOLDOWN_SECS: u64 = 15 * 60;

/// Largest window any backend serves in one request.
const MAX_WINDOW: usize = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {var}")]
    Invalid { var: &'static str, value: String },

    #[error("unknown backend {0:?} (expected \"x\" or \"rss\")")]
    UnknownBackend(String),
}

/// Which source adapter to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    X {
        api_base: String,
        bearer_token: String,
        token_file: Option<PathBuf>,
    },
    Rss {
        base: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub telegram_token: String,
    pub backend: Backend,
    pub state_file: PathBuf,
    pub poll_interval: Duration,
    pub window: usize,
    pub concurrency: usize,
    pub cooldown: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup so tests need not touch the
    /// process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let require = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let backend = match get("FEEDWATCH_BACKEND").as_deref().unwrap_or("x") {
            "x" => {
                let token_file = get("BEARER_TOKEN_FILE").map(PathBuf::from);
                let bearer_token = match (&token_file, get("BEARER_TOKEN")) {
                    (_, Some(token)) => token,
                    // The token is read from the file at startup.
                    (Some(_), None) => String::new(),
                    (None, None) => return Err(ConfigError::Missing("BEARER_TOKEN")),
                };
                Backend::X {
                    api_base: get("FEEDWATCH_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.into()),
                    bearer_token,
                    token_file,
                }
            }
            "rss" => Backend::Rss {
                base: require("FEEDWATCH_RSS_BASE")?,
            },
            other => return Err(ConfigError::UnknownBackend(other.to_string())),
        };

        let poll_secs: u64 = parse_or(&get, "FEEDWATCH_POLL_SECS", DEFAULT_POLL_SECS)?;
        let window: usize = parse_or(&get, "FEEDWATCH_WINDOW", DEFAULT_WINDOW)?;
        let concurrency: usize = parse_or(&get, "FEEDWATCH_CONCURRENCY", DEFAULT_CONCURRENCY)?;
        let cooldown_secs: u64 = parse_or(&get, "FEEDWATCH_COOLDOWN_SECS", DEFAULT_COOLDOWN_SECS)?;

        Ok(Config {
            telegram_token: require("TELEGRAM_TOKEN")?,
            backend,
            state_file: get("FEEDWATCH_STATE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_FILE)),
            poll_interval: Duration::from_secs(poll_secs.max(1)),
            window: window.clamp(1, MAX_WINDOW),
            concurrency: concurrency.max(1),
            cooldown: Duration::from_secs(cooldown_secs),
        })
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            interval: self.poll_interval,
            window: self.window,
            concurrency: self.concurrency,
            default_cooldown: self.cooldown,
            retry: RetryConfig::DEFAULT,
        }
    }
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(var) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value: raw }),
    }
}
