//! Scripted chain source shared by unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ScanError;
use crate::source::ChainSource;
use crate::types::{Block, Input, Output, TokenTransferRecord, Tx, TxKind};

#[derive(Default)]
pub(crate) struct MockSource {
    pub tip: Mutex<u64>,
    pub blocks: Mutex<BTreeMap<u64, Block>>,
    pub txs: Mutex<HashMap<String, Tx>>,
    pub tokens: Mutex<HashMap<String, Vec<TokenTransferRecord>>>,
    /// Delay applied to every token lookup.
    pub token_delay: Duration,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl MockSource {
    pub fn with_token(self, tx_hash: &str, records: Vec<TokenTransferRecord>) -> Self {
        self.tokens.lock().unwrap().insert(tx_hash.to_string(), records);
        self
    }
}

#[async_trait]
impl ChainSource for MockSource {
    async fn tip_height(&self) -> Result<u64, ScanError> {
        Ok(*self.tip.lock().unwrap())
    }

    async fn block_hash(&self, height: u64) -> Result<String, ScanError> {
        self.blocks
            .lock()
            .unwrap()
            .get(&height)
            .map(|b| b.hash.clone())
            .ok_or_else(|| ScanError::Source(format!("no block at {height}")))
    }

    async fn block_by_height(&self, height: u64) -> Result<Block, ScanError> {
        self.blocks
            .lock()
            .unwrap()
            .get(&height)
            .cloned()
            .ok_or_else(|| ScanError::Source(format!("no block at {height}")))
    }

    async fn block_by_hash(&self, hash: &str) -> Result<Block, ScanError> {
        self.blocks
            .lock()
            .unwrap()
            .values()
            .find(|b| b.hash == hash)
            .cloned()
            .ok_or_else(|| ScanError::Source(format!("no block {hash}")))
    }

    async fn tx_by_hash(&self, hash: &str) -> Result<Option<Tx>, ScanError> {
        Ok(self.txs.lock().unwrap().get(hash).cloned())
    }

    async fn token_transfers_by_tx_hash(&self, hash: &str) -> Result<Vec<TokenTransferRecord>, ScanError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.token_delay.is_zero() {
            tokio::time::sleep(self.token_delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(self.tokens.lock().unwrap().get(hash).cloned().unwrap_or_default())
    }
}

pub(crate) fn native_tx(hash: &str, height: u64, inputs: &[(&str, i64)], outputs: &[(&str, i64, i64)]) -> Tx {
    Tx {
        hash: hash.into(),
        block_height: height,
        time: 1_600_000_000,
        kind: TxKind::NativeTransfer,
        inputs: inputs
            .iter()
            .enumerate()
            .map(|(i, (address, value))| Input {
                from_hash: format!("prev-{i}"),
                from_index: i as u32,
                value: *value,
                address: address.to_string(),
            })
            .collect(),
        outputs: outputs
            .iter()
            .map(|(address, value, lock_time)| Output {
                address: address.to_string(),
                value: *value,
                lock_time: *lock_time,
            })
            .collect(),
        confirm_count: 3,
    }
}

pub(crate) fn token_tx(hash: &str, height: u64) -> Tx {
    Tx {
        hash: hash.into(),
        block_height: height,
        time: 1_600_000_000,
        kind: TxKind::TokenTransfer,
        inputs: vec![],
        outputs: vec![],
        confirm_count: 1,
    }
}

pub(crate) fn token_record(hash: &str, from: &str, to: &str, value: &str) -> TokenTransferRecord {
    TokenTransferRecord {
        hash: hash.into(),
        contract_address: "NULSd6Hgcontract".into(),
        from: from.into(),
        to: to.into(),
        value: value.into(),
        name: "Test Token".into(),
        symbol: "TST".into(),
        decimals: 8,
    }
}

pub(crate) fn watch(addresses: &[(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> + Send + Sync {
    let map: HashMap<&'static str, &'static str> = addresses.iter().copied().collect();
    move |addr: &str| map.get(addr).map(|k| k.to_string())
}
