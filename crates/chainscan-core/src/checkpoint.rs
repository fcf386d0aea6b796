//! Checkpoint manager: persists how far scanning has progressed.
//!
//! The checkpoint stores the last fully extracted block height and hash.
//! The same store also keeps scanned blocks (for fork rollback lookups)
//! and unscanned records (failed extractions awaiting retry).

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ScanError;
use crate::types::{Block, UnscannedRecord};

/// The persisted scan position for a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCheckpoint {
    /// Chain slug (e.g. `"nuls"`).
    pub chain_id: String,
    /// Last fully scanned block height.
    pub height: u64,
    /// Hash of the block at `height`.
    pub hash: String,
    /// Unix timestamp of when this checkpoint was saved.
    pub updated_at: i64,
}

/// Trait for durable scan state.
///
/// Implementations include [`MemoryCheckpointStore`] and the SQLite backend
/// in `chainscan-storage`. Every method is namespaced by `chain_id`.
#[async_trait]
pub trait ScanCheckpointStore: Send + Sync {
    async fn load_checkpoint(&self, chain_id: &str) -> Result<Option<ScanCheckpoint>, ScanError>;

    /// Save (upsert) the checkpoint.
    async fn save_checkpoint(&self, checkpoint: ScanCheckpoint) -> Result<(), ScanError>;

    /// Save (upsert) a scanned block keyed by its height.
    async fn save_block(&self, chain_id: &str, block: &Block) -> Result<(), ScanError>;

    async fn block_at_height(&self, chain_id: &str, height: u64) -> Result<Option<Block>, ScanError>;

    /// Save (upsert by id) an unscanned record.
    async fn save_unscanned(&self, chain_id: &str, record: &UnscannedRecord) -> Result<(), ScanError>;

    async fn all_unscanned(&self, chain_id: &str) -> Result<Vec<UnscannedRecord>, ScanError>;

    /// Delete every unscanned record at `height`.
    async fn delete_unscanned(&self, chain_id: &str, height: u64) -> Result<(), ScanError>;

    /// Delete every unscanned record whose reason starts with `reason_prefix`.
    /// Returns how many were removed.
    async fn purge_unscanned_matching(
        &self,
        chain_id: &str,
        reason_prefix: &str,
    ) -> Result<u64, ScanError>;
}

/// Scan-state access bound to one chain.
#[derive(Clone)]
pub struct CheckpointManager {
    store: Arc<dyn ScanCheckpointStore>,
    chain_id: String,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn ScanCheckpointStore>, chain_id: impl Into<String>) -> Self {
        Self {
            store,
            chain_id: chain_id.into(),
        }
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    /// Load the saved checkpoint (returns `None` if none exists).
    pub async fn load(&self) -> Result<Option<ScanCheckpoint>, ScanError> {
        self.store.load_checkpoint(&self.chain_id).await
    }

    /// Immediately save a checkpoint.
    pub async fn save(&self, height: u64, hash: &str) -> Result<(), ScanError> {
        let cp = ScanCheckpoint {
            chain_id: self.chain_id.clone(),
            height,
            hash: hash.to_string(),
            updated_at: chrono::Utc::now().timestamp(),
        };
        self.store.save_checkpoint(cp).await
    }

    pub async fn save_block(&self, block: &Block) -> Result<(), ScanError> {
        self.store.save_block(&self.chain_id, block).await
    }

    pub async fn block_at_height(&self, height: u64) -> Result<Option<Block>, ScanError> {
        self.store.block_at_height(&self.chain_id, height).await
    }

    /// Persist an unscanned record. Records for unconfirmed transactions
    /// (height 0) are never persisted.
    pub async fn record_unscanned(&self, record: UnscannedRecord) -> Result<(), ScanError> {
        if record.block_height == 0 {
            tracing::warn!(tx_id = %record.tx_id, "unconfirmed transaction is not queued for rescan");
            return Ok(());
        }
        tracing::debug!(
            height = record.block_height,
            tx_id = %record.tx_id,
            reason = %record.reason,
            "unscanned record saved"
        );
        self.store.save_unscanned(&self.chain_id, &record).await
    }

    pub async fn unscanned(&self) -> Result<Vec<UnscannedRecord>, ScanError> {
        self.store.all_unscanned(&self.chain_id).await
    }

    pub async fn delete_unscanned(&self, height: u64) -> Result<(), ScanError> {
        self.store.delete_unscanned(&self.chain_id, height).await
    }

    pub async fn purge_unscanned_matching(&self, reason_prefix: &str) -> Result<u64, ScanError> {
        self.store
            .purge_unscanned_matching(&self.chain_id, reason_prefix)
            .await
    }
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

#[derive(Default)]
struct ChainState {
    checkpoint: Option<ScanCheckpoint>,
    blocks: BTreeMap<u64, Block>,
    unscanned: BTreeMap<String, UnscannedRecord>,
}

/// In-memory scan state for tests and ephemeral scanners.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    chains: Mutex<HashMap<String, ChainState>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_chain<T>(&self, chain_id: &str, f: impl FnOnce(&mut ChainState) -> T) -> Result<T, ScanError> {
        let mut chains = self
            .chains
            .lock()
            .map_err(|e| ScanError::Storage(e.to_string()))?;
        Ok(f(chains.entry(chain_id.to_string()).or_default()))
    }
}

#[async_trait]
impl ScanCheckpointStore for MemoryCheckpointStore {
    async fn load_checkpoint(&self, chain_id: &str) -> Result<Option<ScanCheckpoint>, ScanError> {
        self.with_chain(chain_id, |c| c.checkpoint.clone())
    }

    async fn save_checkpoint(&self, checkpoint: ScanCheckpoint) -> Result<(), ScanError> {
        let chain_id = checkpoint.chain_id.clone();
        self.with_chain(&chain_id, |c| c.checkpoint = Some(checkpoint))
    }

    async fn save_block(&self, chain_id: &str, block: &Block) -> Result<(), ScanError> {
        self.with_chain(chain_id, |c| {
            c.blocks.insert(block.height, block.clone());
        })
    }

    async fn block_at_height(&self, chain_id: &str, height: u64) -> Result<Option<Block>, ScanError> {
        self.with_chain(chain_id, |c| c.blocks.get(&height).cloned())
    }

    async fn save_unscanned(&self, chain_id: &str, record: &UnscannedRecord) -> Result<(), ScanError> {
        self.with_chain(chain_id, |c| {
            c.unscanned.insert(record.id.clone(), record.clone());
        })
    }

    async fn all_unscanned(&self, chain_id: &str) -> Result<Vec<UnscannedRecord>, ScanError> {
        self.with_chain(chain_id, |c| c.unscanned.values().cloned().collect())
    }

    async fn delete_unscanned(&self, chain_id: &str, height: u64) -> Result<(), ScanError> {
        self.with_chain(chain_id, |c| c.unscanned.retain(|_, r| r.block_height != height))
    }

    async fn purge_unscanned_matching(
        &self,
        chain_id: &str,
        reason_prefix: &str,
    ) -> Result<u64, ScanError> {
        self.with_chain(chain_id, |c| {
            let before = c.unscanned.len();
            c.unscanned.retain(|_, r| !r.reason.starts_with(reason_prefix));
            (before - c.unscanned.len()) as u64
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> CheckpointManager {
        CheckpointManager::new(Arc::new(MemoryCheckpointStore::new()), "nuls")
    }

    #[tokio::test]
    async fn checkpoint_roundtrip() {
        let mgr = manager();
        assert!(mgr.load().await.unwrap().is_none());

        mgr.save(1000, "0xabc").await.unwrap();

        let cp = mgr.load().await.unwrap().unwrap();
        assert_eq!(cp.height, 1000);
        assert_eq!(cp.hash, "0xabc");
        assert_eq!(cp.chain_id, "nuls");
    }

    #[tokio::test]
    async fn unconfirmed_records_are_dropped() {
        let mgr = manager();
        mgr.record_unscanned(UnscannedRecord::new(0, "tx", "pending"))
            .await
            .unwrap();
        assert!(mgr.unscanned().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unscanned_dedupes_and_deletes_by_height() {
        let mgr = manager();
        mgr.record_unscanned(UnscannedRecord::new(10, "", "a")).await.unwrap();
        mgr.record_unscanned(UnscannedRecord::new(10, "", "b")).await.unwrap();
        mgr.record_unscanned(UnscannedRecord::new(11, "tx", "c")).await.unwrap();
        assert_eq!(mgr.unscanned().await.unwrap().len(), 2);

        mgr.delete_unscanned(10).await.unwrap();
        let left = mgr.unscanned().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].block_height, 11);
    }

    #[tokio::test]
    async fn purge_by_reason_prefix() {
        let mgr = manager();
        mgr.record_unscanned(UnscannedRecord::new(5, "a", "[-5]No information available about transaction a"))
            .await
            .unwrap();
        mgr.record_unscanned(UnscannedRecord::new(6, "b", "timeout")).await.unwrap();

        let removed = mgr
            .purge_unscanned_matching("[-5]No information available about transaction")
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(mgr.unscanned().await.unwrap()[0].reason, "timeout");
    }

    #[tokio::test]
    async fn chains_are_isolated() {
        let store: Arc<dyn ScanCheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        let a = CheckpointManager::new(store.clone(), "nuls");
        let b = CheckpointManager::new(store, "nuls-test");
        a.save(7, "h7").await.unwrap();
        assert!(b.load().await.unwrap().is_none());
    }
}
