//! Redis Snapshot Storage
//!
//! Keeps each endpoint's snapshot as one JSON string under
//! `txnscope:snapshot:<endpoint>`. A single `SET` replaces the value atomically.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::info;

use crate::storage::{Snapshot, Storage, StorageError};

/// Prefix of every snapshot key
pub const KEY_PREFIX: &str = "txnscope:snapshot";

/// Redis key holding the snapshot for `endpoint`
pub fn snapshot_key(endpoint: &str) -> String {
    format!("{}:{}", KEY_PREFIX, endpoint)
}

/// [`Storage`] backed by a Redis string key
pub struct RedisStorage {
    connection: MultiplexedConnection,
    key: String,
}

impl RedisStorage {
    /// Create a storage handle on an established connection
    ///
    /// # Arguments
    /// * `connection` - An established Redis multiplexed connection
    /// * `endpoint` - The ledger endpoint whose snapshot this handle owns
    pub fn new(connection: MultiplexedConnection, endpoint: &str) -> Self {
        Self {
            connection,
            key: snapshot_key(endpoint),
        }
    }

    /// Open a connection to `url` and bind it to `endpoint`
    pub async fn connect(url: &str, endpoint: &str) -> Result<Self, StorageError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        info!("Connected to Redis at {}", url);
        Ok(Self::new(connection, endpoint))
    }

    /// Get the key name
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl Storage for RedisStorage {
    async fn save(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let json = serde_json::to_string(snapshot)?;
        let mut connection = self.connection.clone();
        let _: () = connection.set(&self.key, json).await?;

        info!(
            key = %self.key,
            height = snapshot.last_processed_height,
            "Snapshot saved"
        );
        Ok(())
    }

    async fn load(&self) -> Result<Option<Snapshot>, StorageError> {
        let mut connection = self.connection.clone();
        let raw: Option<String> = connection.get(&self.key).await?;

        raw.map(|json| {
            serde_json::from_str(&json).map_err(|e| StorageError::Corrupt(e.to_string()))
        })
        .transpose()
    }

    fn describe(&self) -> String {
        format!("Redis Storage - {}", self.key)
    }
}
