//! Remote, read-only view of the chain.
//!
//! Implementations wrap an RPC / explorer client. The scanner only consumes
//! already-decoded domain objects; transport and JSON parsing live elsewhere.

use async_trait::async_trait;

use crate::error::ScanError;
use crate::types::{Block, TokenTransferRecord, Tx};

/// Trait for querying the remote chain.
///
/// Every error should be reported as [`ScanError::Source`] so the scanner
/// treats it as transient.
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Current tip height.
    async fn tip_height(&self) -> Result<u64, ScanError>;

    /// Hash of the block at `height` on the node's current best chain.
    ///
    /// The default fetches the whole block; clients with a cheaper hash
    /// lookup should override it.
    async fn block_hash(&self, height: u64) -> Result<String, ScanError> {
        Ok(self.block_by_height(height).await?.hash)
    }

    async fn block_by_height(&self, height: u64) -> Result<Block, ScanError>;

    async fn block_by_hash(&self, hash: &str) -> Result<Block, ScanError>;

    /// Look up a single transaction. `Ok(None)` when the node does not know it.
    async fn tx_by_hash(&self, hash: &str) -> Result<Option<Tx>, ScanError>;

    /// Token transfer details of a contract transaction.
    async fn token_transfers_by_tx_hash(
        &self,
        hash: &str,
    ) -> Result<Vec<TokenTransferRecord>, ScanError>;
}
