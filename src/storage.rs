//! Snapshot Storage
//!
//! Persists the watcher state (cursor plus every address log) so a restart resumes
//! where the previous run stopped. Each storage handle is bound to one ledger endpoint;
//! backends keep separate snapshots per endpoint.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::ledger::TransactionLog;

/// Errors that can occur while saving or loading snapshots
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt snapshot: {0}")]
    Corrupt(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Full persisted state for one endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(rename = "latestBlockNumber")]
    pub last_processed_height: u64,
    #[serde(default)]
    pub subscribed_addresses: BTreeMap<String, TransactionLog>,
}

impl Snapshot {
    /// Snapshot with no subscriptions
    pub fn empty(last_processed_height: u64) -> Self {
        Self {
            last_processed_height,
            subscribed_addresses: BTreeMap::new(),
        }
    }

    pub fn transaction_count(&self) -> usize {
        self.subscribed_addresses.values().map(TransactionLog::len).sum()
    }
}

/// Persistence backend for watcher snapshots.
///
/// Callers serialize `save` calls; implementations only need a single save to be
/// atomic.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Replace the stored snapshot for this endpoint
    async fn save(&self, snapshot: &Snapshot) -> Result<(), StorageError>;

    /// Stored snapshot for this endpoint, or None when nothing was saved yet
    async fn load(&self) -> Result<Option<Snapshot>, StorageError>;

    /// Human readable location, for logs
    fn describe(&self) -> String;
}

/// JSON file holding one snapshot per endpoint:
/// `{ "<endpoint>": { "latestBlockNumber": .., "subscribedAddresses": {..} } }`
#[derive(Debug, Clone)]
pub struct JsonFileStorage {
    path: PathBuf,
    endpoint: String,
}

impl JsonFileStorage {
    pub fn new(path: impl Into<PathBuf>, endpoint: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            endpoint: endpoint.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Every endpoint's snapshot in the file. A missing file is an empty map.
    async fn load_all(&self) -> Result<BTreeMap<String, Snapshot>, StorageError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Snapshot file does not exist, starting fresh");
                return Ok(BTreeMap::new());
            }
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&bytes).map_err(|e| StorageError::Corrupt(e.to_string()))
    }

    /// Write to a sibling temp file, fsync, then rename over the target
    async fn write_atomic(&self, bytes: &[u8]) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = self.temp_path();
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl Storage for JsonFileStorage {
    async fn save(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let mut all = match self.load_all().await {
            Ok(all) => all,
            Err(StorageError::Corrupt(reason)) => {
                warn!(path = %self.path.display(), %reason, "Overwriting corrupt snapshot file");
                BTreeMap::new()
            }
            Err(e) => return Err(e),
        };

        all.insert(self.endpoint.clone(), snapshot.clone());
        let bytes = serde_json::to_vec_pretty(&all)?;
        self.write_atomic(&bytes).await?;

        info!(
            endpoint = %self.endpoint,
            height = snapshot.last_processed_height,
            addresses = snapshot.subscribed_addresses.len(),
            "Snapshot saved"
        );
        Ok(())
    }

    async fn load(&self) -> Result<Option<Snapshot>, StorageError> {
        let mut all = self.load_all().await?;
        Ok(all.remove(&self.endpoint))
    }

    fn describe(&self) -> String {
        format!("Json File Storage - {}", self.path.display())
    }
}

/// Storage kept in process memory; nothing survives a restart
#[derive(Debug, Default)]
pub struct MemoryStorage {
    snapshot: Mutex<Option<Snapshot>>,
    saves: Mutex<usize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage that already holds `snapshot`
    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
            saves: Mutex::new(0),
        }
    }

    /// Most recently saved snapshot
    pub fn latest(&self) -> Option<Snapshot> {
        self.snapshot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of successful saves
    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn save(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        *self.snapshot.lock().unwrap_or_else(|e| e.into_inner()) = Some(snapshot.clone());
        *self.saves.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }

    async fn load(&self) -> Result<Option<Snapshot>, StorageError> {
        Ok(self.latest())
    }

    fn describe(&self) -> String {
        "Memory Storage".to_string()
    }
}
