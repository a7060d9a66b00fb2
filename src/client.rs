//! Ledger Client Module
//!
//! The watcher's view of the remote ledger: the current chain height and the
//! transactions of one block that touch one address. [`RpcLedgerClient`] implements it
//! over HTTP JSON-RPC.

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::transports::http::reqwest::Url;
use alloy::transports::http::{Client, Http};
use alloy::transports::{RpcError, TransportError};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::decoder::{decode_transaction, DecodeError, RpcBlock, RpcTransaction, Transaction};

/// Default public Ethereum RPC endpoint
pub const DEFAULT_ENDPOINT: &str = "https://ethereum-rpc.publicnode.com";

/// Per-request timeout in milliseconds
pub const REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Errors that can occur while talking to the ledger
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed ledger response: {0}")]
    Decode(String),

    #[error("Invalid transaction in block: {0}")]
    Transaction(#[from] DecodeError),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Block {0} not found")]
    BlockNotFound(u64),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl LedgerError {
    /// Whether the failure came from an unparseable response rather than the network
    pub fn is_decode(&self) -> bool {
        matches!(self, LedgerError::Decode(_) | LedgerError::Transaction(_))
    }
}

impl From<TransportError> for LedgerError {
    fn from(err: TransportError) -> Self {
        if matches!(err, RpcError::DeserError { .. }) {
            LedgerError::Decode(err.to_string())
        } else {
            LedgerError::Transport(err.to_string())
        }
    }
}

/// Read access to a ledger endpoint
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Current chain height
    async fn latest_height(&self) -> Result<u64, LedgerError>;

    /// Transactions in block `height` where `address` is the sender or the recipient.
    ///
    /// `address` is lowercase `0x` hex.
    async fn transactions_at(
        &self,
        height: u64,
        address: &str,
    ) -> Result<Vec<Transaction>, LedgerError>;
}

/// Configuration for the RPC client
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// HTTP(S) JSON-RPC endpoint
    pub endpoint: String,
    /// Timeout applied to every request
    pub timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            timeout_ms: REQUEST_TIMEOUT_MS,
        }
    }
}

impl RpcConfig {
    /// Create a new config for the specified endpoint
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Validate that an endpoint looks like an HTTP JSON-RPC URL
pub fn validate_endpoint(endpoint: &str) -> Result<Url, LedgerError> {
    if endpoint.trim().is_empty() {
        return Err(LedgerError::InvalidEndpoint(
            "Endpoint cannot be empty".to_string(),
        ));
    }

    let url: Url = endpoint
        .parse()
        .map_err(|e| LedgerError::InvalidEndpoint(format!("{}: {}", endpoint, e)))?;

    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(LedgerError::InvalidEndpoint(format!(
            "unsupported scheme '{}' in {}",
            scheme, endpoint
        ))),
    }
}

/// Most recently fetched block, shared by every address scanned at that height
struct CachedBlock {
    height: u64,
    transactions: Arc<Vec<RpcTransaction>>,
}

/// [`LedgerClient`] over HTTP JSON-RPC
pub struct RpcLedgerClient {
    config: RpcConfig,
    provider: RootProvider<Http<Client>>,
    last_block: Mutex<Option<CachedBlock>>,
}

impl RpcLedgerClient {
    /// Create a client for the configured endpoint
    pub fn new(config: RpcConfig) -> Result<Self, LedgerError> {
        let url = validate_endpoint(&config.endpoint)?;
        info!("Using ledger endpoint {}", config.endpoint);

        let provider = ProviderBuilder::new().on_http(url);

        Ok(Self {
            config,
            provider,
            last_block: Mutex::new(None),
        })
    }

    /// Create with a specific endpoint and default timeouts
    pub fn with_endpoint(endpoint: impl Into<String>) -> Result<Self, LedgerError> {
        Self::new(RpcConfig::with_endpoint(endpoint))
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    async fn with_timeout<T, F>(&self, request: F) -> Result<T, LedgerError>
    where
        F: IntoFuture<Output = Result<T, TransportError>>,
    {
        match tokio::time::timeout(self.config.timeout(), request).await {
            Ok(result) => result.map_err(LedgerError::from),
            Err(_) => Err(LedgerError::Timeout(self.config.timeout_ms)),
        }
    }

    /// Fetch the full transaction list of a block, reusing the last fetched block
    async fn block_transactions(
        &self,
        height: u64,
    ) -> Result<Arc<Vec<RpcTransaction>>, LedgerError> {
        if let Some(cached) = self.last_block.lock().await.as_ref() {
            if cached.height == height {
                return Ok(Arc::clone(&cached.transactions));
            }
        }

        debug!(height, "Fetching block");
        let block: Option<RpcBlock> = self
            .with_timeout(
                self.provider
                    .raw_request("eth_getBlockByNumber".into(), (format!("{:#x}", height), true)),
            )
            .await?;

        let block = block.ok_or(LedgerError::BlockNotFound(height))?;
        if let Some(number) = block.number {
            if number.to::<u64>() != height {
                warn!(height, returned = %number, "Node returned a different block than requested");
                return Err(LedgerError::Decode(format!(
                    "requested block {} but received {}",
                    height, number
                )));
            }
        }

        let transactions = Arc::new(block.transactions);
        *self.last_block.lock().await = Some(CachedBlock {
            height,
            transactions: Arc::clone(&transactions),
        });
        Ok(transactions)
    }
}

#[async_trait]
impl LedgerClient for RpcLedgerClient {
    async fn latest_height(&self) -> Result<u64, LedgerError> {
        self.with_timeout(self.provider.get_block_number()).await
    }

    async fn transactions_at(
        &self,
        height: u64,
        address: &str,
    ) -> Result<Vec<Transaction>, LedgerError> {
        let address = address.to_lowercase();
        let block = self.block_transactions(height).await?;

        let transactions = block
            .iter()
            .filter(|raw| raw.involves(&address))
            .filter_map(|raw| match decode_transaction(raw) {
                Ok(tx) => Some(tx),
                Err(e) => {
                    warn!(height, address = %address, error = %e, "Skipping undecodable transaction");
                    None
                }
            })
            .collect();
        Ok(transactions)
    }
}
