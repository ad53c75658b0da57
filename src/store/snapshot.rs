//! Persistence of the subscription registry.
//!
//! The store only needs `load` and `save` of a whole [`Snapshot`]; the medium
//! behind that contract is a [`Persistence`] implementation.
//!
//! # File format
//!
//! [`JsonFilePersistence`] writes a versioned JSON document.  Writes are
//! atomic: the snapshot goes to `<path>.tmp`, is fsynced, renamed over
//! `<path>`, and the parent directory is fsynced, so a reader sees either the
//! previous snapshot or the new one, never a partial write.
//!
//! The flat legacy layout (`{"name": {"chat_id": .., "last_tweet_id": ..}}`)
//! is still accepted on load and upgraded on the next save.
//!
//! Tests use the in-memory implementation in `crate::testing`.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::subscription::{normalize_source, ConsumerId, Subscription};
use crate::error::StoreError;

/// Current schema version.  Increment on breaking changes.
pub const SCHEMA_VERSION: u32 = 1;

/// Everything the registry persists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub schema_version: u32,
    pub saved_at: DateTime<Utc>,
    pub subscriptions: Vec<Subscription>,
}

impl Snapshot {
    pub fn new(subscriptions: Vec<Subscription>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            saved_at: Utc::now(),
            subscriptions,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

/// The durable medium behind the store.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn load(&self) -> Result<Snapshot, StoreError>;

    /// Atomic overwrite.  When this returns `Ok`, the snapshot survives a
    /// restart.
    async fn save(&self, snapshot: &Snapshot) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// JSON file
// ---------------------------------------------------------------------------

pub struct JsonFilePersistence {
    path: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Persistence for JsonFilePersistence {
    async fn load(&self) -> Result<Snapshot, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || load_file(&path))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let path = self.path.clone();
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        tokio::task::spawn_blocking(move || save_atomic(&path, &bytes))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

fn load_file(path: &Path) -> Result<Snapshot, StoreError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Snapshot::empty()),
        Err(e) => return Err(e.into()),
    };
    decode(&bytes)
}

fn decode(bytes: &[u8]) -> Result<Snapshot, StoreError> {
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    if value.get("schema_version").is_none() {
        let legacy: HashMap<String, LegacyRecord> = serde_json::from_value(value)?;
        return Ok(upgrade_legacy(legacy));
    }

    let snapshot: Snapshot = serde_json::from_value(value)?;
    if snapshot.schema_version != SCHEMA_VERSION {
        return Err(StoreError::SchemaMismatch {
            expected: SCHEMA_VERSION,
            got: snapshot.schema_version,
        });
    }
    Ok(snapshot)
}

fn save_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    std::fs::rename(&tmp, path)?;
    // The rename is only durable once the directory entry is.
    File::open(parent)?.sync_all()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Legacy flat layout
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LegacyRecord {
    chat_id: LegacyChatId,
    #[serde(default)]
    last_tweet_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LegacyChatId {
    Number(i64),
    Text(String),
}

fn upgrade_legacy(records: HashMap<String, LegacyRecord>) -> Snapshot {
    let subscriptions = records
        .into_iter()
        .filter_map(|(name, record)| {
            let name = normalize_source(&name)?;
            let consumer = match record.chat_id {
                LegacyChatId::Number(id) => ConsumerId::from(id),
                LegacyChatId::Text(id) => ConsumerId(id),
            };
            let mut sub = Subscription::new(name, consumer);
            sub.set_cursor(record.last_tweet_id.filter(|id| !id.is_empty()));
            Some(sub)
        })
        .collect();
    Snapshot::new(subscriptions)
}
