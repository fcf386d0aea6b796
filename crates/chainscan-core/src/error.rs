//! Error types for the scanning pipeline.

use thiserror::Error;

/// Errors that can occur while scanning blocks and extracting transfers.
#[derive(Debug, Error)]
pub enum ScanError {
    /// Remote chain query failed. Halts forward progress for the current cycle.
    #[error("chain source error: {0}")]
    Source(String),

    /// Checkpoint / record store failed.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("extraction failed for tx '{tx_id}': {reason}")]
    Extraction { tx_id: String, reason: String },

    #[error("token transfer lookup for tx '{tx_id}' returned {count} records, expected exactly 1")]
    TokenLookup { tx_id: String, count: usize },

    #[error("observer notification failed: {reason}")]
    Notification { reason: String },

    #[error("block {height} has no transactions to extract")]
    EmptyBlock { height: u64 },

    /// Advisory: every transaction completed but some failed or could not be delivered.
    #[error("block {height}: {failed} of {total} transactions failed extraction or notification")]
    BatchIncomplete { height: u64, failed: usize, total: usize },

    #[error("invalid block height {0}")]
    InvalidHeight(u64),

    #[error("transaction '{0}' not found")]
    TxNotFound(String),

    #[error("{0}")]
    Other(String),
}

impl ScanError {
    /// Returns `true` if the error came from the remote source and a later cycle may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Source(_))
    }

    /// Returns `true` if the checkpoint / record store is unreachable.
    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Text stored as an unscanned record's reason. Source errors keep the
    /// node's raw message so permanent-failure signatures can be matched.
    pub fn reason(&self) -> String {
        match self {
            Self::Source(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}
