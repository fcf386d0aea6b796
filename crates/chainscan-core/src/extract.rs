//! Per-transaction extraction.
//!
//! Turns one chain transaction into wallet records for every watched
//! address it touches. The algorithm is picked by the transaction kind:
//!
//! - native transfers read inputs and outputs straight off the transaction
//! - token transfers need one extra lookup of the contract transfer details
//! - every other kind yields an empty, successful result

use std::collections::BTreeMap;
use std::sync::Arc;

use bigdecimal::{BigDecimal, Zero};
use chrono::Utc;

use crate::config::ScannerConfig;
use crate::error::ScanError;
use crate::filter::AddressFilter;
use crate::record::{
    contract_id, format_amount, format_fixed, input_sid, output_sid, scale_amount, transaction_wx_id, Coin,
    ExtractResult, ExtractedData, SmartContract, Transaction, TxInput, TxOutput, TxStatus,
};
use crate::source::ChainSource;
use crate::types::{Tx, TxKind};

type Extracted = BTreeMap<String, ExtractedData>;

/// Fields shared by every per-key transaction summary of one chain transaction.
struct Summary {
    tx_id: String,
    block_hash: String,
    block_height: u64,
    confirm_time: i64,
    from: Vec<String>,
    to: Vec<String>,
    fees: String,
    coin: Coin,
}

/// Extracts wallet records from single transactions.
pub struct ExtractionEngine {
    source: Arc<dyn ChainSource>,
    symbol: String,
    decimals: u32,
    token_protocol: String,
}

impl ExtractionEngine {
    pub fn new(source: Arc<dyn ChainSource>, config: &ScannerConfig) -> Self {
        Self {
            source,
            symbol: config.symbol.clone(),
            decimals: config.decimals,
            token_protocol: config.token_protocol.clone(),
        }
    }

    /// Extract one transaction found in the block `block_hash` at `block_height`.
    ///
    /// Never returns an error: failures are reported through
    /// [`ExtractResult::failure`] so the caller can queue a retry.
    pub async fn extract(
        &self,
        block_height: u64,
        block_hash: &str,
        tx: Option<&Tx>,
        filter: &dyn AddressFilter,
    ) -> ExtractResult {
        let Some(tx) = tx else {
            return ExtractResult::failed("", block_height, "transaction is missing");
        };

        // The block being scanned knows the height even when the node's
        // transaction view does not.
        let height = if tx.block_height == 0 && block_height > 0 {
            block_height
        } else {
            tx.block_height
        };

        let outcome = match tx.kind {
            TxKind::NativeTransfer => self.extract_native(tx, height, block_hash, filter),
            TxKind::TokenTransfer => self.extract_token(tx, height, block_hash, filter).await,
            TxKind::Other(tag) => {
                tracing::trace!(tx_id = %tx.hash, tag, "transaction kind carries no transfers");
                Ok(Extracted::new())
            }
        };

        match outcome {
            Ok(extracted) => ExtractResult::succeeded(&tx.hash, block_height, extracted),
            Err(e) => {
                tracing::debug!(tx_id = %tx.hash, height, error = %e, "extraction failed");
                ExtractResult::failed(&tx.hash, block_height, e.reason())
            }
        }
    }

    fn native_amount(&self, tx_id: &str, value: i64) -> Result<BigDecimal, ScanError> {
        scale_amount(&value.to_string(), self.decimals).map_err(|e| ScanError::Extraction {
            tx_id: tx_id.to_string(),
            reason: e.to_string(),
        })
    }

    fn extract_native(
        &self,
        tx: &Tx,
        height: u64,
        block_hash: &str,
        filter: &dyn AddressFilter,
    ) -> Result<Extracted, ScanError> {
        let created_at = Utc::now().timestamp();
        let coin = Coin::native(&self.symbol);
        let mut extracted = Extracted::new();

        let mut from = Vec::with_capacity(tx.inputs.len());
        let mut total_in = BigDecimal::zero();
        for (index, input) in (0u32..).zip(&tx.inputs) {
            let amount = self.native_amount(&tx.hash, input.value)?;
            let rendered = format_amount(&amount);
            if let Some(key) = filter.source_key(&input.address) {
                extracted.entry(key).or_default().tx_inputs.push(TxInput {
                    source_tx_id: input.from_hash.clone(),
                    source_index: input.from_index,
                    tx_id: tx.hash.clone(),
                    address: input.address.clone(),
                    amount: rendered.clone(),
                    coin: coin.clone(),
                    index,
                    sid: input_sid(&tx.hash, &self.symbol, "", index),
                    created_at,
                    block_height: height,
                    block_hash: block_hash.to_string(),
                });
            }
            from.push(format!("{}:{}", input.address, rendered));
            total_in += amount;
        }

        let mut to = Vec::with_capacity(tx.outputs.len());
        let mut total_out = BigDecimal::zero();
        for (index, output) in (0u32..).zip(&tx.outputs) {
            if output.is_locked_at(height) {
                tracing::trace!(tx_id = %tx.hash, index, lock_time = output.lock_time, "skipping locked output");
                continue;
            }
            let amount = self.native_amount(&tx.hash, output.value)?;
            let rendered = format_amount(&amount);
            if let Some(key) = filter.source_key(&output.address) {
                extracted.entry(key).or_default().tx_outputs.push(TxOutput {
                    tx_id: tx.hash.clone(),
                    address: output.address.clone(),
                    amount: rendered.clone(),
                    coin: coin.clone(),
                    index,
                    sid: output_sid(&tx.hash, &self.symbol, "", index),
                    created_at,
                    block_height: height,
                    block_hash: block_hash.to_string(),
                    confirm: tx.confirm_count,
                });
            }
            to.push(format!("{}:{}", output.address, rendered));
            total_out += amount;
        }

        let summary = Summary {
            tx_id: tx.hash.clone(),
            block_hash: block_hash.to_string(),
            block_height: height,
            confirm_time: tx.time,
            from,
            to,
            fees: format_fixed(&(total_in - total_out), self.decimals),
            coin,
        };
        attach_summaries(&mut extracted, summary, self.decimals);
        Ok(extracted)
    }

    async fn extract_token(
        &self,
        tx: &Tx,
        height: u64,
        block_hash: &str,
        filter: &dyn AddressFilter,
    ) -> Result<Extracted, ScanError> {
        let transfers = self.source.token_transfers_by_tx_hash(&tx.hash).await?;
        let [transfer] = transfers.as_slice() else {
            return Err(ScanError::TokenLookup {
                tx_id: tx.hash.clone(),
                count: transfers.len(),
            });
        };

        let amount = scale_amount(&transfer.value, transfer.decimals).map_err(|e| ScanError::Extraction {
            tx_id: tx.hash.clone(),
            reason: format!("invalid token value '{}': {e}", transfer.value),
        })?;
        let rendered = format_amount(&amount);

        let contract = SmartContract {
            contract_id: contract_id(&self.symbol, &transfer.contract_address),
            address: transfer.contract_address.clone(),
            decimals: transfer.decimals,
            name: transfer.name.clone(),
            symbol: self.symbol.clone(),
            token: transfer.symbol.clone(),
            protocol: self.token_protocol.clone(),
        };
        let coin = Coin::token(contract);
        let created_at = Utc::now().timestamp();
        let mut extracted = Extracted::new();

        if let Some(key) = filter.source_key(&transfer.from) {
            extracted.entry(key).or_default().tx_inputs.push(TxInput {
                source_tx_id: tx.hash.clone(),
                source_index: 0,
                tx_id: tx.hash.clone(),
                address: transfer.from.clone(),
                amount: rendered.clone(),
                coin: coin.clone(),
                index: 0,
                sid: input_sid(&tx.hash, &self.symbol, &coin.contract_id, 0),
                created_at,
                block_height: height,
                block_hash: block_hash.to_string(),
            });
        }

        if let Some(key) = filter.source_key(&transfer.to) {
            extracted.entry(key).or_default().tx_outputs.push(TxOutput {
                tx_id: tx.hash.clone(),
                address: transfer.to.clone(),
                amount: rendered.clone(),
                coin: coin.clone(),
                index: 0,
                sid: output_sid(&tx.hash, &self.symbol, &coin.contract_id, 0),
                created_at,
                block_height: height,
                block_hash: block_hash.to_string(),
                confirm: tx.confirm_count,
            });
        }

        let summary = Summary {
            tx_id: tx.hash.clone(),
            block_hash: block_hash.to_string(),
            block_height: height,
            confirm_time: tx.time,
            from: vec![format!("{}:{}", transfer.from, rendered)],
            to: vec![format!("{}:{}", transfer.to, rendered)],
            fees: format_fixed(&BigDecimal::zero(), transfer.decimals),
            coin,
        };
        attach_summaries(&mut extracted, summary, transfer.decimals);
        Ok(extracted)
    }
}

/// Give every source key that gained inputs or outputs its own transfer summary.
fn attach_summaries(extracted: &mut Extracted, summary: Summary, decimal: u32) {
    let status = if summary.block_height == 0 {
        TxStatus::Pending
    } else {
        TxStatus::Success
    };

    for data in extracted.values_mut() {
        let mut transaction = Transaction {
            wx_id: String::new(),
            tx_id: summary.tx_id.clone(),
            from: summary.from.clone(),
            to: summary.to.clone(),
            fees: summary.fees.clone(),
            coin: summary.coin.clone(),
            block_hash: summary.block_hash.clone(),
            block_height: summary.block_height,
            decimal,
            confirm_time: summary.confirm_time,
            status,
        };
        transaction.wx_id = transaction_wx_id(&transaction);
        data.transaction = Some(transaction);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::RejectAll;
    use crate::testutil::{native_tx, token_record, token_tx, watch, MockSource};
    use crate::types::TxKind;

    fn engine(source: MockSource) -> ExtractionEngine {
        ExtractionEngine::new(Arc::new(source), &ScannerConfig::default())
    }

    fn zero_timestamps(mut result: ExtractResult) -> ExtractResult {
        for data in result.extracted.values_mut() {
            data.tx_inputs.iter_mut().for_each(|i| i.created_at = 0);
            data.tx_outputs.iter_mut().for_each(|o| o.created_at = 0);
        }
        result
    }

    #[tokio::test]
    async fn native_transfer_groups_by_source_key() {
        let engine = engine(MockSource::default());
        let tx = native_tx(
            "tx1",
            100,
            &[("alice", 300_000_000)],
            &[("bob", 200_000_000, 0), ("alice", 50_000_000, 0)],
        );
        let filter = watch(&[("alice", "wallet-a"), ("bob", "wallet-b")]);

        let result = engine.extract(100, "h100", Some(&tx), &filter).await;
        assert!(result.success);
        assert_eq!(result.extracted.len(), 2);

        let a = &result.extracted["wallet-a"];
        assert_eq!(a.tx_inputs.len(), 1);
        assert_eq!(a.tx_inputs[0].amount, "3");
        assert_eq!(a.tx_outputs.len(), 1);
        assert_eq!(a.tx_outputs[0].amount, "0.5");
        assert_eq!(a.tx_outputs[0].index, 1);

        let summary = a.transaction.as_ref().unwrap();
        assert_eq!(summary.fees, "0.50000000");
        assert_eq!(summary.from, vec!["alice:3"]);
        assert_eq!(summary.to, vec!["bob:2", "alice:0.5"]);
        assert_eq!(summary.status, TxStatus::Success);
        assert_eq!(summary.block_hash, "h100");

        let b = &result.extracted["wallet-b"];
        assert!(b.tx_inputs.is_empty());
        assert_eq!(b.transaction.as_ref().unwrap().wx_id, summary.wx_id);
    }

    #[tokio::test]
    async fn locked_outputs_are_skipped() {
        let engine = engine(MockSource::default());
        let tx = native_tx("tx2", 100, &[("alice", 100)], &[("bob", 60, 500), ("bob", 40, 0)]);
        let filter = watch(&[("bob", "wallet-b")]);

        let result = engine.extract(100, "h100", Some(&tx), &filter).await;
        let b = &result.extracted["wallet-b"];
        assert_eq!(b.tx_outputs.len(), 1);
        assert_eq!(b.tx_outputs[0].index, 1);
        assert_eq!(b.transaction.as_ref().unwrap().to.len(), 1);
    }

    #[tokio::test]
    async fn unwatched_transaction_yields_nothing() {
        let engine = engine(MockSource::default());
        let tx = native_tx("tx3", 100, &[("x", 1)], &[("y", 1, 0)]);
        let result = engine.extract(100, "h100", Some(&tx), &RejectAll).await;
        assert!(result.success);
        assert!(result.extracted.is_empty());
    }

    #[tokio::test]
    async fn repeated_extraction_is_identical() {
        let engine = engine(MockSource::default());
        let tx = native_tx("tx4", 7, &[("alice", 10)], &[("bob", 9, 0)]);
        let filter = watch(&[("alice", "a"), ("bob", "b")]);

        let first = zero_timestamps(engine.extract(7, "h7", Some(&tx), &filter).await);
        let second = zero_timestamps(engine.extract(7, "h7", Some(&tx), &filter).await);
        assert_eq!(
            serde_json::to_string(&first.extracted).unwrap(),
            serde_json::to_string(&second.extracted).unwrap()
        );
    }

    #[tokio::test]
    async fn height_falls_back_to_scanned_block() {
        let engine = engine(MockSource::default());
        let tx = native_tx("tx5", 0, &[("alice", 10)], &[]);
        let filter = watch(&[("alice", "a")]);

        let scanned = engine.extract(42, "h42", Some(&tx), &filter).await;
        let data = &scanned.extracted["a"];
        assert_eq!(data.tx_inputs[0].block_height, 42);
        assert_eq!(data.transaction.as_ref().unwrap().status, TxStatus::Success);

        let pending = engine.extract(0, "", Some(&tx), &filter).await;
        assert_eq!(
            pending.extracted["a"].transaction.as_ref().unwrap().status,
            TxStatus::Pending
        );
    }

    #[tokio::test]
    async fn token_transfer_uses_lookup() {
        let source = MockSource::default().with_token(
            "ttx",
            vec![token_record("ttx", "alice", "bob", "250000000")],
        );
        let engine = engine(source);
        let filter = watch(&[("bob", "wallet-b")]);

        let result = engine.extract(10, "h10", Some(&token_tx("ttx", 10)), &filter).await;
        assert!(result.success);
        let out = &result.extracted["wallet-b"].tx_outputs[0];
        assert_eq!(out.amount, "2.5");
        assert!(out.coin.is_contract);
        let contract = out.coin.contract.as_ref().unwrap();
        assert_eq!(contract.protocol, "nrc20");
        assert_eq!(contract.token, "TST");
        let summary = result.extracted["wallet-b"].transaction.as_ref().unwrap();
        assert_eq!(summary.fees, "0.00000000");
    }

    #[tokio::test]
    async fn token_lookup_must_return_exactly_one() {
        let source = MockSource::default().with_token(
            "ttx",
            vec![
                token_record("ttx", "alice", "bob", "1"),
                token_record("ttx", "alice", "carol", "1"),
            ],
        );
        let engine = engine(source);
        let filter = watch(&[("bob", "b")]);

        let result = engine.extract(10, "h10", Some(&token_tx("ttx", 10)), &filter).await;
        assert!(!result.success);
        assert!(result.failure.unwrap().contains("returned 2 records"));

        let missing = engine.extract(10, "h10", Some(&token_tx("none", 10)), &filter).await;
        assert!(!missing.success);
    }

    #[tokio::test]
    async fn unparseable_token_value_fails() {
        let source = MockSource::default().with_token("ttx", vec![token_record("ttx", "a", "b", "1.2.3")]);
        let engine = engine(source);
        let result = engine.extract(10, "h10", Some(&token_tx("ttx", 10)), &RejectAll).await;
        assert!(!result.success);
        assert!(result.failure.unwrap().contains("invalid token value"));
    }

    #[tokio::test]
    async fn other_kinds_and_missing_tx() {
        let engine = engine(MockSource::default());
        let mut tx = native_tx("tx6", 10, &[("alice", 1)], &[]);
        tx.kind = TxKind::Other(1);
        let filter = watch(&[("alice", "a")]);

        let other = engine.extract(10, "h10", Some(&tx), &filter).await;
        assert!(other.success);
        assert!(other.extracted.is_empty());

        let missing = engine.extract(10, "h10", None, &filter).await;
        assert!(!missing.success);
        assert!(missing.failure.is_some());
    }
}
