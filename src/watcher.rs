//! Watcher
//!
//! Public entry point: owns the subscription ledger and the ingestion engine, exposes
//! the thread-safe read/subscribe operations and drives the engine lifecycle.
//! Construct one per endpoint and share it as `Arc<Watcher>`.

use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::client::{LedgerClient, LedgerError};
use crate::config::WatcherConfig;
use crate::decoder::Transaction;
use crate::engine::{EngineState, Ingestor, TickReport};
use crate::ledger::SubscriptionLedger;
use crate::storage::Storage;

/// Errors that can occur while starting or running a watcher
#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("Failed to get initial chain height: {0}")]
    InitialHeight(#[source] LedgerError),

    #[error("Watcher already started")]
    AlreadyStarted,

    #[error("Watcher has been stopped")]
    Stopped,

    #[error("A manual poll is in progress")]
    Busy,
}

/// Thread-safe facade over the ledger and the ingestion engine
pub struct Watcher {
    config: WatcherConfig,
    ledger: Arc<SubscriptionLedger>,
    ingestor: Arc<Ingestor>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    // Held by `poll_once` so a manual tick never overlaps the engine task
    manual: tokio::sync::Mutex<()>,
}

impl Watcher {
    /// Build a watcher, restoring state from `storage` when possible.
    ///
    /// A stored snapshot is resumed as is. Without one (or if it cannot be read) the
    /// cursor starts at `config.start_height`, or at the current chain tip when no
    /// start height is configured. Failing to get that tip aborts startup.
    pub async fn init(
        config: WatcherConfig,
        client: Arc<dyn LedgerClient>,
        storage: Arc<dyn Storage>,
    ) -> Result<Self, WatcherError> {
        let ledger = match storage.load().await {
            Ok(Some(snapshot)) => {
                info!(
                    storage = %storage.describe(),
                    height = snapshot.last_processed_height,
                    addresses = snapshot.subscribed_addresses.len(),
                    transactions = snapshot.transaction_count(),
                    "Resuming from snapshot"
                );
                if let Some(start) = config.start_height {
                    warn!(start, "Start height ignored, a snapshot exists for this endpoint");
                }
                SubscriptionLedger::from_snapshot(snapshot)
            }
            Ok(None) => {
                let start = Self::fresh_start(&config, client.as_ref()).await?;
                info!(start, "No snapshot found, starting fresh");
                SubscriptionLedger::new(start)
            }
            Err(e) => {
                let start = Self::fresh_start(&config, client.as_ref()).await?;
                warn!(
                    storage = %storage.describe(),
                    error = %e,
                    start,
                    "Discarding unreadable snapshot, starting fresh"
                );
                SubscriptionLedger::new(start)
            }
        };

        Ok(Self::with_ledger(config, Arc::new(ledger), client, storage))
    }

    /// Build a watcher around an existing ledger without touching storage
    pub fn with_ledger(
        config: WatcherConfig,
        ledger: Arc<SubscriptionLedger>,
        client: Arc<dyn LedgerClient>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        let ingestor = Arc::new(Ingestor::new(Arc::clone(&ledger), client, storage, &config));
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            ledger,
            ingestor,
            shutdown,
            task: Mutex::new(None),
            manual: tokio::sync::Mutex::new(()),
        }
    }

    async fn fresh_start(
        config: &WatcherConfig,
        client: &dyn LedgerClient,
    ) -> Result<u64, WatcherError> {
        match config.start_height {
            Some(start) => Ok(start),
            None => client
                .latest_height()
                .await
                .map_err(WatcherError::InitialHeight),
        }
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    /// Spawn the ingestion loop on the current tokio runtime
    pub fn start(&self) -> Result<(), WatcherError> {
        if *self.shutdown.borrow() {
            return Err(WatcherError::Stopped);
        }

        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return Err(WatcherError::AlreadyStarted);
        }

        let Ok(_manual) = self.manual.try_lock() else {
            return Err(WatcherError::Busy);
        };

        let ingestor = Arc::clone(&self.ingestor);
        let shutdown = self.shutdown.subscribe();
        *task = Some(tokio::spawn(async move { ingestor.run(shutdown).await }));

        info!(endpoint = %self.config.endpoint, "Watcher started");
        Ok(())
    }

    /// Signal shutdown and wait (bounded) for the final snapshot.
    ///
    /// Only the first call has an effect. If the engine was never started, or had to be
    /// aborted, the final snapshot is saved here instead.
    pub async fn stop(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }

        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(mut handle) = task else {
            // Wait out a manual tick; it sees the shutdown signal and abandons its batch
            let _manual = self.manual.lock().await;
            self.ingestor.finish().await;
            return;
        };

        let timeout = self.config.shutdown_timeout();
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => {
                info!("Watcher stopped");
                return;
            }
            Ok(Err(e)) => error!(error = %e, "Ingestion task failed"),
            Err(_) => {
                error!(?timeout, "Ingestion task did not stop in time, aborting");
                handle.abort();
                let _ = handle.await;
            }
        }

        // The engine task is gone, so this is the only writer left
        self.ingestor.finish().await;
    }

    /// Run one processing tick immediately, outside the timer.
    ///
    /// Only allowed while the engine task is not running: fails with `AlreadyStarted`
    /// after `start` and with `Stopped` after `stop`.
    pub async fn poll_once(&self) -> Result<TickReport, WatcherError> {
        let _manual = self.manual.lock().await;

        if *self.shutdown.borrow() {
            return Err(WatcherError::Stopped);
        }
        if self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
        {
            return Err(WatcherError::AlreadyStarted);
        }

        let mut shutdown = self.shutdown.subscribe();
        self.ingestor
            .poll(&mut shutdown)
            .await
            .map_err(|_| WatcherError::Stopped)
    }

    /// Start watching `address`. False if it was already watched.
    pub fn subscribe(&self, address: &str) -> bool {
        self.ledger.subscribe(address)
    }

    /// Last fully processed height
    pub fn current_height(&self) -> u64 {
        self.ledger.current_height()
    }

    pub fn list_subscriptions(&self) -> Vec<String> {
        self.ledger.list_subscriptions()
    }

    /// Recorded transactions of `address`; None when the address is not watched
    pub fn transactions_for(&self, address: &str) -> Option<Vec<Transaction>> {
        self.ledger.transactions_for(address)
    }

    pub fn state(&self) -> EngineState {
        self.ingestor.state()
    }
}
