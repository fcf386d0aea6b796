//! Scanner configuration and fluent builder.
//!
//! # Example
//!
//! ```rust
//! use chainscan_core::config::ScannerBuilder;
//!
//! let config = ScannerBuilder::new()
//!     .chain("nuls")
//!     .symbol("NULS")
//!     .max_extracting_size(16)
//!     .rescan_last_block_count(2)
//!     .build_config();
//! assert_eq!(config.max_extracting_size, 16);
//! ```

use serde::{Deserialize, Deserializer, Serialize};

/// Reason prefix the node returns for transactions it will never know about.
pub const NOT_FOUND_REASON: &str = "[-5]No information available about transaction";

/// Smallest usable fork rewind depth. A rewind must land strictly below the
/// dropped block, measured from the height being fetched.
pub const MIN_FORK_REWIND_DEPTH: u64 = 2;

/// Configuration for a scanner instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Chain slug, used as the store namespace.
    pub chain_id: String,
    /// Coin symbol put on headers and coins.
    pub symbol: String,
    /// Native coin precision.
    pub decimals: u32,
    /// Maximum number of transactions extracted concurrently.
    pub max_extracting_size: usize,
    /// How many blocks behind the checkpoint to re-extract after each cycle.
    pub rescan_last_block_count: u64,
    /// How far back to rewind when a fork is detected. Only shallow reorgs
    /// (up to this depth) are fully recovered. Never below
    /// [`MIN_FORK_REWIND_DEPTH`].
    #[serde(deserialize_with = "deserialize_rewind_depth")]
    pub fork_rewind_depth: u64,
    /// Consecutive block fetch failures tolerated before a cycle halts.
    pub max_fetch_failures: u32,
    /// Interval between scan cycles of the background task (milliseconds).
    pub poll_interval_ms: u64,
    /// Unscanned records whose reason starts with this are purged by the retry pass.
    pub not_found_reason: String,
    /// Protocol tag on token contract metadata.
    pub token_protocol: String,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            chain_id: "nuls".into(),
            symbol: "NULS".into(),
            decimals: 8,
            max_extracting_size: 10,
            rescan_last_block_count: 1,
            fork_rewind_depth: 2,
            max_fetch_failures: 3,
            poll_interval_ms: 5_000,
            not_found_reason: NOT_FOUND_REASON.into(),
            token_protocol: "nrc20".into(),
        }
    }
}

impl ScannerConfig {
    /// Effective rewind depth, clamped for configs built by hand.
    pub fn rewind_depth(&self) -> u64 {
        self.fork_rewind_depth.max(MIN_FORK_REWIND_DEPTH)
    }
}

fn deserialize_rewind_depth<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    Ok(u64::deserialize(deserializer)?.max(MIN_FORK_REWIND_DEPTH))
}

/// Fluent builder for [`ScannerConfig`].
#[derive(Default)]
pub struct ScannerBuilder {
    config: ScannerConfig,
}

impl ScannerBuilder {
    pub fn new() -> Self {
        Self {
            config: ScannerConfig::default(),
        }
    }

    /// Set the chain slug (store namespace).
    pub fn chain(mut self, chain_id: impl Into<String>) -> Self {
        self.config.chain_id = chain_id.into();
        self
    }

    pub fn symbol(mut self, symbol: impl Into<String>) -> Self {
        self.config.symbol = symbol.into();
        self
    }

    pub fn decimals(mut self, decimals: u32) -> Self {
        self.config.decimals = decimals;
        self
    }

    /// Set the extraction admission limit. Clamped to at least 1.
    pub fn max_extracting_size(mut self, n: usize) -> Self {
        self.config.max_extracting_size = n.max(1);
        self
    }

    pub fn rescan_last_block_count(mut self, n: u64) -> Self {
        self.config.rescan_last_block_count = n;
        self
    }

    /// Set the fork rewind depth. Clamped to at least [`MIN_FORK_REWIND_DEPTH`].
    pub fn fork_rewind_depth(mut self, depth: u64) -> Self {
        self.config.fork_rewind_depth = depth.max(MIN_FORK_REWIND_DEPTH);
        self
    }

    pub fn max_fetch_failures(mut self, n: u32) -> Self {
        self.config.max_fetch_failures = n;
        self
    }

    /// Set the background polling interval in milliseconds.
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn not_found_reason(mut self, reason: impl Into<String>) -> Self {
        self.config.not_found_reason = reason.into();
        self
    }

    pub fn token_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.config.token_protocol = protocol.into();
        self
    }

    /// Build the `ScannerConfig`.
    pub fn build_config(self) -> ScannerConfig {
        self.config
    }
}
