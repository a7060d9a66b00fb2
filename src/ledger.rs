//! Subscription Ledger
//!
//! In-memory map of watched address to transaction log, plus the processing cursor.
//! One readers-writer lock guards both, so every reader sees the logs and the cursor
//! from a single point in time.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use alloy::primitives::TxHash;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::decoder::Transaction;
use crate::storage::Snapshot;

/// Canonical form of a watched address: trimmed, lowercase
pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}

/// Transactions recorded for one address, in discovery order.
///
/// Hashes are unique within a log. The check is a linear scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionLog {
    pub transactions: Vec<Transaction>,
}

impl TransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, hash: &TxHash) -> bool {
        self.transactions.iter().any(|tx| &tx.hash == hash)
    }

    /// Append unless a transaction with the same hash is already recorded
    pub fn append(&mut self, tx: Transaction) -> bool {
        if self.contains(&tx.hash) {
            return false;
        }
        self.transactions.push(tx);
        true
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    cursor: u64,
    logs: HashMap<String, TransactionLog>,
}

/// Watched addresses, their logs and the last processed height
#[derive(Debug, Default)]
pub struct SubscriptionLedger {
    state: RwLock<LedgerState>,
}

impl SubscriptionLedger {
    /// Empty ledger whose cursor starts at `start_height`
    pub fn new(start_height: u64) -> Self {
        Self {
            state: RwLock::new(LedgerState {
                cursor: start_height,
                logs: HashMap::new(),
            }),
        }
    }

    /// Rebuild a ledger from persisted state
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let logs = snapshot
            .subscribed_addresses
            .into_iter()
            .map(|(address, log)| (normalize_address(&address), log))
            .collect();

        Self {
            state: RwLock::new(LedgerState {
                cursor: snapshot.last_processed_height,
                logs,
            }),
        }
    }

    // A panicking writer cannot leave a log half-appended, so a poisoned lock is
    // still consistent.
    fn read(&self) -> RwLockReadGuard<'_, LedgerState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, LedgerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start watching `address`. Returns false if it is already watched or empty.
    pub fn subscribe(&self, address: &str) -> bool {
        let address = normalize_address(address);
        if address.is_empty() {
            return false;
        }

        let mut state = self.write();
        if state.logs.contains_key(&address) {
            return false;
        }
        state.logs.insert(address.clone(), TransactionLog::new());
        drop(state);

        info!(address = %address, "Subscribed address");
        true
    }

    pub fn is_subscribed(&self, address: &str) -> bool {
        self.read().logs.contains_key(&normalize_address(address))
    }

    /// All watched addresses, sorted
    pub fn list_subscriptions(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.read().logs.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    /// Last height whose processing completed
    pub fn current_height(&self) -> u64 {
        self.read().cursor
    }

    /// Copy of the log for `address`, or None if it is not watched
    pub fn transactions_for(&self, address: &str) -> Option<Vec<Transaction>> {
        self.read()
            .logs
            .get(&normalize_address(address))
            .map(|log| log.transactions.clone())
    }

    pub fn len(&self) -> usize {
        self.read().logs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().logs.is_empty()
    }

    /// Record the fetch results for `height` and mark it processed.
    ///
    /// Duplicates (by hash) are dropped. The cursor never moves backwards. Returns the
    /// number of transactions actually appended.
    pub fn commit_height(&self, height: u64, found: Vec<(String, Vec<Transaction>)>) -> usize {
        let mut state = self.write();
        let mut appended = 0;

        for (address, transactions) in found {
            let Some(log) = state.logs.get_mut(&address) else {
                continue;
            };
            for tx in transactions {
                let hash = tx.hash;
                if log.append(tx) {
                    appended += 1;
                    info!(address = %address, hash = %hash, height, "Recorded transaction");
                } else {
                    debug!(address = %address, hash = %hash, height, "Duplicate transaction ignored");
                }
            }
        }

        state.cursor = state.cursor.max(height);
        appended
    }

    /// Consistent copy of the whole ledger for persistence
    pub fn snapshot(&self) -> Snapshot {
        let state = self.read();
        Snapshot {
            last_processed_height: state.cursor,
            subscribed_addresses: state
                .logs
                .iter()
                .map(|(address, log)| (address.clone(), log.clone()))
                .collect::<BTreeMap<_, _>>(),
        }
    }
}
