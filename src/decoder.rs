//! Transaction Decoder
//!
//! Turns raw JSON-RPC transaction objects into the fixed [`Transaction`] record stored
//! per watched address. Every field is extracted and validated here so the rest of the
//! crate never touches untyped payloads.

use alloy::primitives::{Address, BlockHash, TxHash, U128, U256, U64};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while decoding a ledger transaction
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Missing field in transaction: {0}")]
    MissingField(&'static str),

    #[error("Transaction {0} is not included in a block")]
    Pending(TxHash),

    #[error("Invalid transaction type: {0}")]
    InvalidTxType(u64),
}

/// A transaction object as returned by `eth_getBlockByNumber(_, true)`.
///
/// Only the fields the watcher records are declared; everything else in the payload
/// is ignored by serde.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcTransaction {
    pub hash: Option<TxHash>,
    pub block_hash: Option<BlockHash>,
    pub block_number: Option<U64>,
    pub from: Option<Address>,
    pub to: Option<Address>,
    #[serde(rename = "type")]
    pub tx_type: Option<U64>,
    pub gas: Option<U64>,
    pub gas_price: Option<U128>,
    pub nonce: Option<U64>,
    pub value: Option<U256>,
}

impl RpcTransaction {
    /// Check whether `address` (lowercase `0x` hex) is the sender or the recipient
    pub fn involves(&self, address: &str) -> bool {
        let matches = |candidate: Option<Address>| {
            candidate.is_some_and(|a| format!("{:#x}", a) == address)
        };
        matches(self.from) || matches(self.to)
    }
}

/// A block object as returned by `eth_getBlockByNumber(_, true)`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcBlock {
    pub number: Option<U64>,
    #[serde(default)]
    pub transactions: Vec<RpcTransaction>,
}

/// One recorded transaction touching a watched address.
///
/// Immutable once decoded. The hash is the identity; all other fields are
/// informational.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Transaction hash
    pub hash: TxHash,
    /// Hash of the containing block
    pub block_hash: BlockHash,
    /// Height of the containing block
    pub block_number: u64,
    /// Sender address
    pub from: Address,
    /// Recipient address (None for contract creation)
    pub to: Option<Address>,
    /// EIP-2718 transaction type (0 for legacy)
    pub tx_type: u8,
    /// Gas limit reported by the node
    pub gas: u64,
    /// Gas price in wei (effective price for EIP-1559 transactions)
    pub gas_price: u128,
    /// Sender nonce
    pub nonce: u64,
    /// Address of the created contract, set only for contract creation
    pub contract_address: Option<Address>,
    /// Transferred value in wei
    #[serde(default)]
    pub value: U256,
}

impl Transaction {
    /// Transaction hash as lowercase hex with 0x prefix
    pub fn hash_hex(&self) -> String {
        format!("{:#x}", self.hash)
    }

    /// Whether this transaction deployed a contract
    pub fn is_contract_creation(&self) -> bool {
        self.to.is_none()
    }
}

/// Decode a raw RPC transaction into a [`Transaction`]
///
/// Hash, block hash, block number, sender, nonce and gas are required. Type, gas price
/// and value default to zero when the node omits them.
pub fn decode_transaction(raw: &RpcTransaction) -> Result<Transaction, DecodeError> {
    let hash = raw.hash.ok_or(DecodeError::MissingField("hash"))?;
    let block_hash = raw.block_hash.ok_or(DecodeError::Pending(hash))?;
    let block_number = raw.block_number.ok_or(DecodeError::Pending(hash))?.to::<u64>();
    let from = raw.from.ok_or(DecodeError::MissingField("from"))?;
    let nonce = raw.nonce.ok_or(DecodeError::MissingField("nonce"))?.to::<u64>();
    let gas = raw.gas.ok_or(DecodeError::MissingField("gas"))?.to::<u64>();

    let tx_type = match raw.tx_type {
        Some(t) => {
            let t = t.to::<u64>();
            u8::try_from(t).map_err(|_| DecodeError::InvalidTxType(t))?
        }
        None => 0,
    };

    let contract_address = match raw.to {
        Some(_) => None,
        None => Some(from.create(nonce)),
    };

    Ok(Transaction {
        hash,
        block_hash,
        block_number,
        from,
        to: raw.to,
        tx_type,
        gas,
        gas_price: raw.gas_price.map(|p| p.to::<u128>()).unwrap_or_default(),
        nonce,
        contract_address,
        value: raw.value.unwrap_or_default(),
    })
}
