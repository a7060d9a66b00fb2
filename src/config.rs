//! Watcher configuration

use std::path::PathBuf;
use std::time::Duration;

use crate::client::{DEFAULT_ENDPOINT, REQUEST_TIMEOUT_MS};

/// Interval between chain height polls
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10_000;

/// How long `stop` waits for the engine before aborting it
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

/// Default snapshot file
pub const DEFAULT_SNAPSHOT_FILE: &str = "data.json";

/// Configuration for a [`Watcher`](crate::watcher::Watcher)
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Ledger JSON-RPC endpoint; also the snapshot namespace
    pub endpoint: String,
    /// Poll interval in milliseconds
    pub poll_interval_ms: u64,
    /// Per-request timeout for ledger calls in milliseconds
    pub request_timeout_ms: u64,
    /// Bounded wait for the engine on shutdown, in milliseconds
    pub shutdown_timeout_ms: u64,
    /// Height to treat as already processed when no snapshot exists.
    /// `None` starts at the current chain tip.
    pub start_height: Option<u64>,
    /// Cap on heights processed in one tick; `None` drains the whole backlog
    pub max_blocks_per_tick: Option<u64>,
    /// Snapshot file path; `~/` is expanded
    pub snapshot_path: String,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            request_timeout_ms: REQUEST_TIMEOUT_MS,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            start_height: None,
            max_blocks_per_tick: None,
            snapshot_path: DEFAULT_SNAPSHOT_FILE.to_string(),
        }
    }
}

impl WatcherConfig {
    /// Create a new config for the specified endpoint
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn start_height(mut self, height: u64) -> Self {
        self.start_height = Some(height);
        self
    }

    pub fn poll_every(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn max_blocks_per_tick(mut self, max: u64) -> Self {
        self.max_blocks_per_tick = Some(max.max(1));
        self
    }

    pub fn poll_interval(&self) -> Duration {
        // A zero period would make tokio's interval panic
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Snapshot path with a leading `~/` expanded
    pub fn snapshot_path(&self) -> PathBuf {
        PathBuf::from(expand_path(&self.snapshot_path))
    }
}

/// Expand ~ to home directory in path
pub fn expand_path(path: &str) -> String {
    if path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return path.replacen("~", &home.to_string_lossy(), 1);
        }
    }
    path.to_string()
}
