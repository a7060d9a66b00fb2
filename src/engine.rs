//! Ingestion Engine
//!
//! Polls the ledger on a fixed interval and drains every height between the cursor and
//! the chain head:
//!
//! 1. snapshot the watched addresses at the start of the batch
//! 2. for each height, fetch each address's transactions without holding the ledger lock
//! 3. commit the height (dedup + cursor advance) under the write lock
//! 4. persist once per tick if anything new was recorded
//!
//! A failed fetch is logged and skipped; the height still counts as processed. Every
//! suspension point (timer, ledger call) also listens for the shutdown signal. On
//! shutdown the current height is abandoned uncommitted and one final snapshot is saved.

use std::future::Future;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::client::LedgerClient;
use crate::config::WatcherConfig;
use crate::ledger::SubscriptionLedger;
use crate::storage::Storage;

/// Engine lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Waiting for the next tick
    Idle,
    /// Draining heights between the cursor and the chain head
    Processing,
    /// Shut down; no further ticks are served
    Stopped,
}

/// The shutdown signal fired while the engine was suspended
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("ingestion cancelled by shutdown")]
pub struct Cancelled;

/// Outcome of one tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Chain head observed this tick; None when the height query failed
    pub chain_height: Option<u64>,
    /// Heights processed this tick
    pub heights: Option<RangeInclusive<u64>>,
    /// Transactions appended to some log
    pub new_transactions: usize,
    /// Address/height fetches that failed and were skipped
    pub failed_fetches: usize,
    /// Whether a snapshot was saved successfully at the end of the tick
    pub persisted: bool,
}

impl TickReport {
    pub fn processed_count(&self) -> u64 {
        self.heights
            .as_ref()
            .map(|r| r.end() - r.start() + 1)
            .unwrap_or(0)
    }
}

/// Resolves once shutdown is requested. A dropped sender also counts as shutdown.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Run `fut` unless shutdown is requested first
async fn cancellable<F: Future>(
    shutdown: &mut watch::Receiver<bool>,
    fut: F,
) -> Result<F::Output, Cancelled> {
    tokio::select! {
        biased;
        _ = shutdown_requested(shutdown) => Err(Cancelled),
        out = fut => Ok(out),
    }
}

/// Single writer of the subscription ledger
pub struct Ingestor {
    ledger: Arc<SubscriptionLedger>,
    client: Arc<dyn LedgerClient>,
    storage: Arc<dyn Storage>,
    poll_interval: Duration,
    max_blocks_per_tick: Option<u64>,
    state: watch::Sender<EngineState>,
}

impl Ingestor {
    pub fn new(
        ledger: Arc<SubscriptionLedger>,
        client: Arc<dyn LedgerClient>,
        storage: Arc<dyn Storage>,
        config: &WatcherConfig,
    ) -> Self {
        let (state, _) = watch::channel(EngineState::Idle);
        Self {
            ledger,
            client,
            storage,
            poll_interval: config.poll_interval(),
            max_blocks_per_tick: config.max_blocks_per_tick,
            state,
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition
    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: EngineState) {
        self.state.send_replace(state);
    }

    /// Poll loop. Returns after shutdown, once the final snapshot has been attempted.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            height = self.ledger.current_height(),
            poll_interval = ?self.poll_interval,
            storage = %self.storage.describe(),
            "Ingestion engine started"
        );

        let mut ticker = interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                _ = ticker.tick() => {}
            }

            match self.poll(&mut shutdown).await {
                Ok(report) => debug!(?report, "Tick complete"),
                Err(Cancelled) => break,
            }
        }

        self.finish().await;
    }

    /// Enter `Stopped` and save the final snapshot. Callers must ensure no tick is running.
    pub async fn finish(&self) {
        self.set_state(EngineState::Stopped);
        info!(height = self.ledger.current_height(), "Ingestion engine stopped, saving data");
        self.persist().await;
    }

    /// One tick without a shutdown signal
    pub async fn tick(&self) -> TickReport {
        let (_keep_open, mut never) = watch::channel(false);
        self.poll(&mut never).await.unwrap_or_default()
    }

    /// One tick: observe the chain head and drain the backlog up to it
    pub async fn poll(&self, shutdown: &mut watch::Receiver<bool>) -> Result<TickReport, Cancelled> {
        let mut report = TickReport::default();

        let head = match cancellable(shutdown, self.client.latest_height()).await? {
            Ok(head) => head,
            Err(e) => {
                warn!(error = %e, "Error polling latest block");
                return Ok(report);
            }
        };
        report.chain_height = Some(head);

        let cursor = self.ledger.current_height();
        if head <= cursor {
            debug!(head, cursor, "No new blocks");
            return Ok(report);
        }

        let first = cursor + 1;
        let last = match self.max_blocks_per_tick {
            Some(max) => head.min(cursor.saturating_add(max.max(1))),
            None => head,
        };

        if self.state() == EngineState::Stopped {
            return Err(Cancelled);
        }
        self.set_state(EngineState::Processing);
        let result = self.process_range(first, last, shutdown, &mut report).await;
        self.state.send_if_modified(|state| {
            let processing = *state == EngineState::Processing;
            if processing {
                *state = EngineState::Idle;
            }
            processing
        });
        result?;

        report.heights = Some(first..=last);
        info!(
            first,
            last,
            head,
            new_transactions = report.new_transactions,
            failed_fetches = report.failed_fetches,
            "Processed blocks"
        );

        if report.new_transactions > 0 {
            report.persisted = self.persist().await;
        }
        Ok(report)
    }

    async fn process_range(
        &self,
        first: u64,
        last: u64,
        shutdown: &mut watch::Receiver<bool>,
        report: &mut TickReport,
    ) -> Result<(), Cancelled> {
        // Addresses subscribed after this point are picked up by the next batch
        let addresses = self.ledger.list_subscriptions();

        for height in first..=last {
            let mut found = Vec::with_capacity(addresses.len());

            for address in &addresses {
                match cancellable(shutdown, self.client.transactions_at(height, address)).await? {
                    Ok(transactions) => found.push((address.clone(), transactions)),
                    Err(e) => {
                        report.failed_fetches += 1;
                        warn!(
                            height,
                            address = %address,
                            error = %e,
                            "Error getting transactions, skipping address for this block"
                        );
                    }
                }
            }

            report.new_transactions += self.ledger.commit_height(height, found);
        }
        Ok(())
    }

    /// Save the current snapshot. Failures are logged, never propagated.
    pub async fn persist(&self) -> bool {
        let snapshot = self.ledger.snapshot();
        match self.storage.save(&snapshot).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    storage = %self.storage.describe(),
                    height = snapshot.last_processed_height,
                    error = %e,
                    "Failed to persist snapshot"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::LedgerError;
    use crate::decoder::Transaction;
    use crate::storage::{MemoryStorage, Snapshot, StorageError};
    use alloy::primitives::{Address, B256, U256};
    use async_trait::async_trait;
    use mockall::mock;

    const ALICE: &str = "0x1111111111111111111111111111111111111111";
    const BOB: &str = "0x2222222222222222222222222222222222222222";

    mock! {
        pub Ledger {}

        #[async_trait]
        impl LedgerClient for Ledger {
            async fn latest_height(&self) -> Result<u64, LedgerError>;
            async fn transactions_at(&self, height: u64, address: &str) -> Result<Vec<Transaction>, LedgerError>;
        }
    }

    /// Ledger whose block fetches never complete
    struct StallingLedger {
        head: u64,
    }

    #[async_trait]
    impl LedgerClient for StallingLedger {
        async fn latest_height(&self) -> Result<u64, LedgerError> {
            Ok(self.head)
        }

        async fn transactions_at(&self, _: u64, _: &str) -> Result<Vec<Transaction>, LedgerError> {
            std::future::pending().await
        }
    }

    struct FailingStorage;

    #[async_trait]
    impl Storage for FailingStorage {
        async fn save(&self, _: &Snapshot) -> Result<(), StorageError> {
            Err(StorageError::Corrupt("disk full".to_string()))
        }

        async fn load(&self) -> Result<Option<Snapshot>, StorageError> {
            Ok(None)
        }

        fn describe(&self) -> String {
            "Failing Storage".to_string()
        }
    }

    fn tx(hash_byte: u8, block: u64) -> Transaction {
        Transaction {
            hash: B256::repeat_byte(hash_byte),
            block_hash: B256::repeat_byte(0xbb),
            block_number: block,
            from: Address::repeat_byte(0x11),
            to: Some(Address::repeat_byte(0x22)),
            tx_type: 0,
            gas: 21_000,
            gas_price: 1,
            nonce: 0,
            contract_address: None,
            value: U256::ZERO,
        }
    }

    fn ingestor(
        start: u64,
        client: impl LedgerClient + 'static,
        storage: Arc<dyn Storage>,
        config: &WatcherConfig,
    ) -> (Arc<SubscriptionLedger>, Ingestor) {
        let ledger = Arc::new(SubscriptionLedger::new(start));
        let ingestor = Ingestor::new(Arc::clone(&ledger), Arc::new(client), storage, config);
        (ledger, ingestor)
    }

    // ==================== tick tests ====================

    #[tokio::test]
    async fn test_tick_without_new_blocks_is_noop() {
        let mut client = MockLedger::new();
        client.expect_latest_height().returning(|| Ok(100));
        client.expect_transactions_at().never();

        let storage = Arc::new(MemoryStorage::new());
        let (ledger, ingestor) = ingestor(100, client, storage.clone(), &WatcherConfig::default());
        ledger.subscribe(ALICE);

        let report = ingestor.tick().await;

        assert_eq!(report.chain_height, Some(100));
        assert_eq!(report.heights, None);
        assert_eq!(ledger.current_height(), 100);
        assert_eq!(storage.save_count(), 0);
        assert_eq!(ingestor.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn test_tick_height_error_keeps_cursor() {
        let mut client = MockLedger::new();
        client
            .expect_latest_height()
            .returning(|| Err(LedgerError::Transport("connection refused".to_string())));

        let (ledger, ingestor) = ingestor(
            50,
            client,
            Arc::new(MemoryStorage::new()),
            &WatcherConfig::default(),
        );

        let report = ingestor.tick().await;

        assert_eq!(report.chain_height, None);
        assert_eq!(ledger.current_height(), 50);
    }

    #[tokio::test]
    async fn test_tick_processes_each_height_once_per_address() {
        let mut client = MockLedger::new();
        client.expect_latest_height().returning(|| Ok(13));
        client
            .expect_transactions_at()
            .times(6)
            .returning(|height, address| {
                if height == 12 && address == ALICE {
                    Ok(vec![tx(0xab, 12)])
                } else {
                    Ok(vec![])
                }
            });

        let storage = Arc::new(MemoryStorage::new());
        let (ledger, ingestor) = ingestor(10, client, storage.clone(), &WatcherConfig::default());
        ledger.subscribe(ALICE);
        ledger.subscribe(BOB);

        let report = ingestor.tick().await;

        assert_eq!(report.heights, Some(11..=13));
        assert_eq!(report.processed_count(), 3);
        assert_eq!(report.new_transactions, 1);
        assert!(report.persisted);
        assert_eq!(ledger.current_height(), 13);
        assert_eq!(ledger.transactions_for(ALICE).unwrap(), vec![tx(0xab, 12)]);
        assert_eq!(ledger.transactions_for(BOB).unwrap(), vec![]);
        assert_eq!(storage.save_count(), 1);
        assert_eq!(storage.latest().unwrap().last_processed_height, 13);
    }

    #[tokio::test]
    async fn test_fetch_error_skips_address_and_advances_cursor() {
        let mut client = MockLedger::new();
        client.expect_latest_height().returning(|| Ok(2));
        client.expect_transactions_at().returning(|height, address| {
            if address == ALICE {
                Err(LedgerError::Timeout(10_000))
            } else {
                Ok(vec![tx(height as u8, height)])
            }
        });

        let (ledger, ingestor) = ingestor(
            0,
            client,
            Arc::new(MemoryStorage::new()),
            &WatcherConfig::default(),
        );
        ledger.subscribe(ALICE);
        ledger.subscribe(BOB);

        let report = ingestor.tick().await;

        assert_eq!(report.failed_fetches, 2);
        assert_eq!(report.new_transactions, 2);
        assert_eq!(ledger.current_height(), 2);
        assert_eq!(ledger.transactions_for(ALICE), Some(vec![]));
        assert_eq!(ledger.transactions_for(BOB).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_tick_without_new_transactions_does_not_persist() {
        let mut client = MockLedger::new();
        client.expect_latest_height().returning(|| Ok(5));
        client.expect_transactions_at().returning(|_, _| Ok(vec![]));

        let storage = Arc::new(MemoryStorage::new());
        let (ledger, ingestor) = ingestor(0, client, storage.clone(), &WatcherConfig::default());
        ledger.subscribe(ALICE);

        let report = ingestor.tick().await;

        assert_eq!(ledger.current_height(), 5);
        assert!(!report.persisted);
        assert_eq!(storage.save_count(), 0);
    }

    #[tokio::test]
    async fn test_persist_failure_keeps_memory_state() {
        let mut client = MockLedger::new();
        client.expect_latest_height().returning(|| Ok(1));
        client
            .expect_transactions_at()
            .returning(|_, _| Ok(vec![tx(1, 1)]));

        let (ledger, ingestor) = ingestor(0, client, Arc::new(FailingStorage), &WatcherConfig::default());
        ledger.subscribe(ALICE);

        let report = ingestor.tick().await;

        assert!(!report.persisted);
        assert_eq!(ledger.current_height(), 1);
        assert_eq!(ledger.transactions_for(ALICE).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_max_blocks_per_tick_limits_batch() {
        let mut client = MockLedger::new();
        client.expect_latest_height().returning(|| Ok(1_000));
        client.expect_transactions_at().returning(|_, _| Ok(vec![]));

        let config = WatcherConfig::default().max_blocks_per_tick(10);
        let (ledger, ingestor) = ingestor(0, client, Arc::new(MemoryStorage::new()), &config);
        ledger.subscribe(ALICE);

        let first = ingestor.tick().await;
        assert_eq!(first.heights, Some(1..=10));

        let second = ingestor.tick().await;
        assert_eq!(second.heights, Some(11..=20));
        assert_eq!(ledger.current_height(), 20);
    }

    #[tokio::test]
    async fn test_cursor_is_non_decreasing_across_ticks() {
        let heads = std::sync::Mutex::new(vec![3u64, 7, 5, 7, 12].into_iter());
        let mut client = MockLedger::new();
        client
            .expect_latest_height()
            .returning(move || Ok(heads.lock().unwrap().next().unwrap_or(12)));
        client.expect_transactions_at().returning(|_, _| Ok(vec![]));

        let (ledger, ingestor) = ingestor(
            0,
            client,
            Arc::new(MemoryStorage::new()),
            &WatcherConfig::default(),
        );
        ledger.subscribe(ALICE);

        let mut last = ledger.current_height();
        for _ in 0..5 {
            ingestor.tick().await;
            let height = ledger.current_height();
            assert!(height >= last);
            last = height;
        }
        assert_eq!(last, 12);
    }

    // ==================== run loop tests ====================

    #[tokio::test]
    async fn test_run_stops_on_shutdown_and_saves_once() {
        let mut client = MockLedger::new();
        client.expect_latest_height().returning(|| Ok(0));

        let storage = Arc::new(MemoryStorage::new());
        let config = WatcherConfig::default().poll_every(Duration::from_millis(10));
        let (_ledger, ingestor) = ingestor(0, client, storage.clone(), &config);
        let ingestor = Arc::new(ingestor);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = {
            let ingestor = Arc::clone(&ingestor);
            tokio::spawn(async move { ingestor.run(shutdown_rx).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send_replace(true);
        handle.await.unwrap();

        assert_eq!(ingestor.state(), EngineState::Stopped);
        assert_eq!(storage.save_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_pending_fetch() {
        let storage = Arc::new(MemoryStorage::new());
        let config = WatcherConfig::default().poll_every(Duration::from_millis(5));
        let (ledger, ingestor) = ingestor(10, StallingLedger { head: 20 }, storage.clone(), &config);
        ledger.subscribe(ALICE);
        let ingestor = Arc::new(ingestor);
        let mut states = ingestor.watch_state();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = {
            let ingestor = Arc::clone(&ingestor);
            tokio::spawn(async move { ingestor.run(shutdown_rx).await })
        };

        states
            .wait_for(|s| *s == EngineState::Processing)
            .await
            .unwrap();
        shutdown_tx.send_replace(true);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("engine did not stop")
            .unwrap();

        // The stalled height was abandoned, not committed
        assert_eq!(ledger.current_height(), 10);
        assert_eq!(ingestor.state(), EngineState::Stopped);
        assert_eq!(storage.save_count(), 1);
    }

    #[tokio::test]
    async fn test_poll_after_shutdown_is_cancelled() {
        let mut client = MockLedger::new();
        client.expect_latest_height().returning(|| Ok(5));

        let (_ledger, ingestor) = ingestor(
            0,
            client,
            Arc::new(MemoryStorage::new()),
            &WatcherConfig::default(),
        );

        let (_tx, mut shutdown) = watch::channel(true);
        assert_eq!(ingestor.poll(&mut shutdown).await, Err(Cancelled));
    }

    #[tokio::test]
    async fn test_finished_engine_serves_no_ticks() {
        let mut client = MockLedger::new();
        client.expect_latest_height().returning(|| Ok(20));
        client.expect_transactions_at().never();

        let storage = Arc::new(MemoryStorage::new());
        let (ledger, ingestor) = ingestor(10, client, storage.clone(), &WatcherConfig::default());
        ledger.subscribe(ALICE);

        ingestor.finish().await;
        let report = ingestor.tick().await;

        assert_eq!(report.heights, None);
        assert_eq!(ledger.current_height(), 10);
        assert_eq!(ingestor.state(), EngineState::Stopped);
        assert_eq!(storage.save_count(), 1);
    }
}
