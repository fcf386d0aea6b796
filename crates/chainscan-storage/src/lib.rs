//! chainscan-storage: storage backends for chainscan.
//!
//! Backends:
//! - [`memory`]: in-memory bookkeeping ledger fed by scanner notifications
//! - [`sqlite`]: SQLite scan state via `sqlx` (checkpoint, scanned blocks, unscanned records)

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::InMemoryLedger;
