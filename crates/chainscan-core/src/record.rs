//! Wallet-side records produced by extraction.
//!
//! One [`ExtractResult`] is produced per transaction. It groups the extracted
//! inputs, outputs and the synthesized transfer summary by *source key*, the
//! opaque owner id the [`AddressFilter`](crate::filter::AddressFilter) returns
//! for a watched address.

use std::collections::BTreeMap;
use std::str::FromStr;

use bigdecimal::{BigDecimal, ParseBigDecimalError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ─── Coin ─────────────────────────────────────────────────────────────────────

/// Metadata of a contract token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmartContract {
    pub contract_id: String,
    pub address: String,
    pub decimals: u32,
    pub name: String,
    /// Symbol of the chain the contract lives on.
    pub symbol: String,
    /// Symbol of the token itself.
    pub token: String,
    /// Protocol tag, e.g. `"nrc20"`.
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub symbol: String,
    pub is_contract: bool,
    #[serde(default)]
    pub contract_id: String,
    #[serde(default)]
    pub contract: Option<SmartContract>,
}

impl Coin {
    /// The chain's native coin.
    pub fn native(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            is_contract: false,
            contract_id: String::new(),
            contract: None,
        }
    }

    /// A contract token on the chain `symbol`.
    pub fn token(contract: SmartContract) -> Self {
        Self {
            symbol: contract.symbol.clone(),
            is_contract: true,
            contract_id: contract.contract_id.clone(),
            contract: Some(contract),
        }
    }
}

// ─── Inputs / outputs ─────────────────────────────────────────────────────────

/// A watched address spending value in a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub source_tx_id: String,
    pub source_index: u32,
    pub tx_id: String,
    pub address: String,
    /// Decimal amount, already scaled by the coin's precision.
    pub amount: String,
    pub coin: Coin,
    pub index: u32,
    pub sid: String,
    /// Unix timestamp of extraction. The only non-deterministic field.
    pub created_at: i64,
    pub block_height: u64,
    pub block_hash: String,
}

/// A watched address receiving value in a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub tx_id: String,
    pub address: String,
    pub amount: String,
    pub coin: Coin,
    pub index: u32,
    pub sid: String,
    pub created_at: i64,
    pub block_height: u64,
    pub block_hash: String,
    pub confirm: u64,
}

// ─── Transaction summary ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    /// Included in a block.
    Success,
    /// Extracted on demand before it was mined.
    Pending,
}

/// Synthesized transfer summary for one source key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub wx_id: String,
    pub tx_id: String,
    /// `"address:amount"` for every input, watched or not.
    pub from: Vec<String>,
    /// `"address:amount"` for every spendable output, watched or not.
    pub to: Vec<String>,
    /// `total_in - total_out`, fixed to the chain's precision.
    pub fees: String,
    pub coin: Coin,
    pub block_hash: String,
    pub block_height: u64,
    pub decimal: u32,
    pub confirm_time: i64,
    pub status: TxStatus,
}

/// Everything extracted from one transaction for one source key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedData {
    pub tx_inputs: Vec<TxInput>,
    pub tx_outputs: Vec<TxOutput>,
    pub transaction: Option<Transaction>,
}

/// Outcome of extracting a single transaction.
///
/// Owned by the task that produced it until handed to the merging consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractResult {
    pub tx_id: String,
    pub block_height: u64,
    pub success: bool,
    /// Why extraction failed; `None` on success.
    pub failure: Option<String>,
    /// Ordered by source key so repeated extraction is byte-identical.
    pub extracted: BTreeMap<String, ExtractedData>,
}

impl ExtractResult {
    pub fn succeeded(
        tx_id: impl Into<String>,
        block_height: u64,
        extracted: BTreeMap<String, ExtractedData>,
    ) -> Self {
        Self {
            tx_id: tx_id.into(),
            block_height,
            success: true,
            failure: None,
            extracted,
        }
    }

    pub fn failed(tx_id: impl Into<String>, block_height: u64, reason: impl Into<String>) -> Self {
        Self {
            tx_id: tx_id.into(),
            block_height,
            success: false,
            failure: Some(reason.into()),
            extracted: BTreeMap::new(),
        }
    }
}

// ─── Amounts ──────────────────────────────────────────────────────────────────

/// Scale an integer amount string down by `decimals` places.
pub fn scale_amount(raw: &str, decimals: u32) -> Result<BigDecimal, ParseBigDecimalError> {
    BigDecimal::from_str(&format!("{raw}e-{decimals}"))
}

/// Shortest plain rendering, e.g. `1.5`, `100`, `0`.
pub fn format_amount(amount: &BigDecimal) -> String {
    amount.normalized().to_plain_string()
}

/// Rendering with exactly `decimals` fractional digits, e.g. `0.50000000`.
pub fn format_fixed(amount: &BigDecimal, decimals: u32) -> String {
    amount.with_scale(i64::from(decimals)).to_plain_string()
}

// ─── Deterministic ids ────────────────────────────────────────────────────────

fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Id of a token contract on chain `symbol`.
pub fn contract_id(symbol: &str, contract_address: &str) -> String {
    sha256_hex(&format!("{symbol}_{contract_address}"))
}

pub fn input_sid(tx_id: &str, symbol: &str, contract_id: &str, index: u32) -> String {
    sha256_hex(&format!("input_{tx_id}_{symbol}_{contract_id}_{index}"))
}

pub fn output_sid(tx_id: &str, symbol: &str, contract_id: &str, index: u32) -> String {
    sha256_hex(&format!("output_{tx_id}_{symbol}_{contract_id}_{index}"))
}

/// Id of a synthesized transaction summary.
pub fn transaction_wx_id(tx: &Transaction) -> String {
    sha256_hex(&format!(
        "{}_{}_{}_{}_{}",
        tx.tx_id, tx.coin.symbol, tx.coin.contract_id, tx.block_hash, tx.block_height
    ))
}

// ─── Tests ────────────────────────────────────────────────────────────────────
