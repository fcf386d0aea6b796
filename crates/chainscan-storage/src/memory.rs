//! In-memory bookkeeping ledger.
//!
//! Books everything the scanner extracts, keyed by source key, and undoes
//! it again when a block is rolled back. Useful for testing and for
//! short-lived wallets that don't need persistence.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use chainscan_core::error::ScanError;
use chainscan_core::observer::ScanObserver;
use chainscan_core::record::{ExtractedData, Transaction, TxInput, TxOutput};
use chainscan_core::types::BlockHeader;

#[derive(Default)]
struct Account {
    /// Keyed by `sid`, so re-extracted records replace earlier copies.
    inputs: BTreeMap<String, TxInput>,
    outputs: BTreeMap<String, TxOutput>,
    /// Keyed by `wx_id`.
    transactions: BTreeMap<String, Transaction>,
}

impl Account {
    fn drop_from(&mut self, height: u64) -> usize {
        let before = self.inputs.len() + self.outputs.len() + self.transactions.len();
        self.inputs.retain(|_, i| i.block_height < height);
        self.outputs.retain(|_, o| o.block_height < height);
        self.transactions.retain(|_, t| t.block_height < height);
        before - (self.inputs.len() + self.outputs.len() + self.transactions.len())
    }
}

#[derive(Default)]
struct LedgerState {
    accounts: HashMap<String, Account>,
    last_header: Option<BlockHeader>,
}

/// Scan observer that keeps extracted records per source key.
///
/// A header with `fork == true` removes every record booked at or above
/// its height. All data is lost when the process exits.
#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Source keys that have booked records, sorted.
    pub fn source_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state().accounts.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn inputs(&self, source_key: &str) -> Vec<TxInput> {
        self.state()
            .accounts
            .get(source_key)
            .map(|a| a.inputs.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn outputs(&self, source_key: &str) -> Vec<TxOutput> {
        self.state()
            .accounts
            .get(source_key)
            .map(|a| a.outputs.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn transactions(&self, source_key: &str) -> Vec<Transaction> {
        self.state()
            .accounts
            .get(source_key)
            .map(|a| a.transactions.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Last header notified without the fork flag.
    pub fn last_header(&self) -> Option<BlockHeader> {
        self.state().last_header.clone()
    }

    /// Remove every record booked at or above `height`. Returns how many were removed.
    pub fn rollback_from(&self, height: u64) -> usize {
        let mut state = self.state();
        let removed: usize = state.accounts.values_mut().map(|a| a.drop_from(height)).sum();
        state.accounts.retain(|_, a| {
            !(a.inputs.is_empty() && a.outputs.is_empty() && a.transactions.is_empty())
        });
        if state.last_header.as_ref().is_some_and(|h| h.height >= height) {
            state.last_header = None;
        }
        removed
    }
}

#[async_trait]
impl ScanObserver for InMemoryLedger {
    async fn on_new_header(&self, header: &BlockHeader) -> Result<(), ScanError> {
        if header.fork {
            let removed = self.rollback_from(header.height);
            tracing::info!(height = header.height, hash = %header.hash, removed, "ledger rolled back");
        } else {
            self.state().last_header = Some(header.clone());
        }
        Ok(())
    }

    async fn on_extracted_data(&self, source_key: &str, data: &ExtractedData) -> Result<(), ScanError> {
        let mut state = self.state();
        let account = state.accounts.entry(source_key.to_string()).or_default();
        for input in &data.tx_inputs {
            account.inputs.insert(input.sid.clone(), input.clone());
        }
        for output in &data.tx_outputs {
            account.outputs.insert(output.sid.clone(), output.clone());
        }
        if let Some(tx) = &data.transaction {
            account.transactions.insert(tx.wx_id.clone(), tx.clone());
        }
        Ok(())
    }
}
