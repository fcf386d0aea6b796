//! Chain-side types consumed by the scanner: blocks, transactions, token transfers.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ─── BlockHeader ──────────────────────────────────────────────────────────────

/// Header delivered to observers for every scanned (or rolled back) block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    pub height: u64,
    pub hash: String,
    pub previous_hash: String,
    pub merkle_root: String,
    /// Unix timestamp of the block.
    pub time: i64,
    /// Coin symbol of the chain (e.g. `"NULS"`).
    pub symbol: String,
    /// `true` only when the header is part of a fork rollback notification.
    pub fork: bool,
}

// ─── Block ────────────────────────────────────────────────────────────────────

/// A fully fetched block. Persisted locally by height for rollback lookups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub hash: String,
    pub height: u64,
    pub time: i64,
    pub previous_hash: String,
    pub merkle_root: String,
    #[serde(default)]
    pub transactions: Vec<Tx>,
    #[serde(default)]
    pub confirm_count: u64,
}

impl Block {
    /// Build the observer header for this block.
    pub fn header(&self, symbol: &str, fork: bool) -> BlockHeader {
        BlockHeader {
            height: self.height,
            hash: self.hash.clone(),
            previous_hash: self.previous_hash.clone(),
            merkle_root: self.merkle_root.clone(),
            time: self.time,
            symbol: symbol.to_string(),
            fork,
        }
    }

    /// Returns `true` if this block's parent is the block with hash `parent_hash`.
    pub fn extends(&self, parent_hash: &str) -> bool {
        self.previous_hash == parent_hash
    }
}

// ─── Transactions ─────────────────────────────────────────────────────────────

/// Transaction kind tag. Selects the extraction algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum TxKind {
    /// Plain coin transfer (`type = 2`).
    NativeTransfer,
    /// Contract token transfer (`type = 101`), needs a token lookup.
    TokenTransfer,
    /// Any other transaction type; carries no transfers we understand.
    Other(i32),
}

impl TxKind {
    pub const NATIVE_TRANSFER: i32 = 2;
    pub const TOKEN_TRANSFER: i32 = 101;
}

impl From<i32> for TxKind {
    fn from(tag: i32) -> Self {
        match tag {
            Self::NATIVE_TRANSFER => Self::NativeTransfer,
            Self::TOKEN_TRANSFER => Self::TokenTransfer,
            other => Self::Other(other),
        }
    }
}

impl From<TxKind> for i32 {
    fn from(kind: TxKind) -> Self {
        match kind {
            TxKind::NativeTransfer => TxKind::NATIVE_TRANSFER,
            TxKind::TokenTransfer => TxKind::TOKEN_TRANSFER,
            TxKind::Other(tag) => tag,
        }
    }
}

/// A spent output referenced by a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Input {
    pub from_hash: String,
    pub from_index: u32,
    /// Value in the chain's smallest unit.
    pub value: i64,
    pub address: String,
}

/// A newly created output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Output {
    pub address: String,
    /// Value in the chain's smallest unit.
    pub value: i64,
    /// Height until which the output stays locked (0 = unlocked).
    #[serde(default)]
    pub lock_time: i64,
}

impl Output {
    /// Returns `true` if the output is still locked at `height`.
    pub fn is_locked_at(&self, height: u64) -> bool {
        i64::try_from(height).map_or(false, |h| self.lock_time > h)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tx {
    pub hash: String,
    /// 0 while unconfirmed.
    #[serde(default)]
    pub block_height: u64,
    pub time: i64,
    #[serde(rename = "type")]
    pub kind: TxKind,
    #[serde(default)]
    pub inputs: Vec<Input>,
    #[serde(default)]
    pub outputs: Vec<Output>,
    #[serde(default)]
    pub confirm_count: u64,
}

/// Details of a contract token transfer, fetched per transaction hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenTransferRecord {
    pub hash: String,
    pub contract_address: String,
    pub from: String,
    pub to: String,
    /// Raw integer amount as a decimal string.
    pub value: String,
    pub name: String,
    pub symbol: String,
    pub decimals: u32,
}

// ─── UnscannedRecord ──────────────────────────────────────────────────────────

/// Durable marker that a block or transaction failed extraction and must be retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnscannedRecord {
    /// `hex(sha256("{height}_{tx_id}"))`, so the same failure never duplicates.
    pub id: String,
    pub block_height: u64,
    /// Empty for block-level failures.
    pub tx_id: String,
    pub reason: String,
}

impl UnscannedRecord {
    pub fn new(block_height: u64, tx_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let tx_id = tx_id.into();
        Self {
            id: unscanned_record_id(block_height, &tx_id),
            block_height,
            tx_id,
            reason: reason.into(),
        }
    }
}

fn unscanned_record_id(height: u64, tx_id: &str) -> String {
    hex::encode(Sha256::digest(format!("{height}_{tx_id}").as_bytes()))
}

// ─── Tests ────────────────────────────────────────────────────────────────────
