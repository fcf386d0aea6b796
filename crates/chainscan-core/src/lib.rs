//! chainscan-core: block scanning and transfer extraction for UTXO chains.
//!
//! # Architecture
//!
//! ```text
//! ScannerBuilder → Scanner              (height loop, fork rollback, retry pass)
//!                     ├── ChainSource        (remote node, read-only)
//!                     ├── CheckpointManager  (checkpoint, scanned blocks, unscanned records)
//!                     ├── BatchExtractor     (bounded fan-out, single merging consumer)
//!                     │      └── ExtractionEngine (native / token transfers)
//!                     └── ObserverRegistry   (wallet-side notifications)
//! ```

pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod extract;
pub mod filter;
pub mod observer;
pub mod record;
pub mod scanner;
pub mod source;
pub mod types;

#[cfg(test)]
mod testutil;

pub use batch::BatchExtractor;
pub use checkpoint::{CheckpointManager, MemoryCheckpointStore, ScanCheckpoint, ScanCheckpointStore};
pub use config::{ScannerBuilder, ScannerConfig};
pub use error::ScanError;
pub use extract::ExtractionEngine;
pub use filter::{AddressFilter, RejectAll};
pub use observer::{ObserverRegistry, ScanObserver};
pub use record::{Coin, ExtractResult, ExtractedData, SmartContract, Transaction, TxInput, TxOutput, TxStatus};
pub use scanner::Scanner;
pub use source::ChainSource;
pub use types::{Block, BlockHeader, Input, Output, TokenTransferRecord, Tx, TxKind, UnscannedRecord};
