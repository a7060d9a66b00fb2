//! TxnScope Watcher Library
//!
//! This crate watches a set of ledger addresses, polls the chain for new blocks,
//! records every transaction touching a watched address and persists the result
//! so a restart resumes where it left off.

pub mod api;
pub mod client;
pub mod config;
pub mod decoder;
pub mod engine;
pub mod ledger;
pub mod redis_storage;
pub mod storage;
pub mod watcher;

// Re-export commonly used types
pub use client::{LedgerClient, LedgerError, RpcLedgerClient};
pub use config::WatcherConfig;
pub use decoder::{decode_transaction, Transaction};
pub use engine::{EngineState, TickReport};
pub use ledger::SubscriptionLedger;
pub use storage::{JsonFileStorage, MemoryStorage, Snapshot, Storage, StorageError};
pub use watcher::{Watcher, WatcherError};
