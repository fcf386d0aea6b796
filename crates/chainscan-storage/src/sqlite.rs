//! SQLite storage backend for scan state.
//!
//! Persists the checkpoint, scanned blocks and unscanned records of every
//! chain in a single SQLite file. One long-lived pool serves all operations.
//!
//! # Usage
//! ```rust,no_run
//! use chainscan_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./scan.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use chainscan_core::checkpoint::{ScanCheckpoint, ScanCheckpointStore};
use chainscan_core::error::ScanError;
use chainscan_core::types::{Block, UnscannedRecord};

fn storage_err(e: impl std::fmt::Display) -> ScanError {
    ScanError::Storage(e.to_string())
}

/// SQLite-backed scan state.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./scan.db"`) or a full
    /// SQLite URL (`"sqlite:./scan.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, ScanError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;
        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database. All data is lost when the pool is dropped.
    pub async fn in_memory() -> Result<Self, ScanError> {
        let pool = SqlitePool::connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;
        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    async fn init_schema(&self) -> Result<(), ScanError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                chain_id   TEXT    NOT NULL PRIMARY KEY,
                height     INTEGER NOT NULL,
                hash       TEXT    NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS blocks (
                chain_id   TEXT    NOT NULL,
                height     INTEGER NOT NULL,
                hash       TEXT    NOT NULL,
                block_json TEXT    NOT NULL,
                PRIMARY KEY (chain_id, height)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS unscanned_records (
                chain_id     TEXT    NOT NULL,
                id           TEXT    NOT NULL,
                block_height INTEGER NOT NULL,
                tx_id        TEXT    NOT NULL,
                reason       TEXT    NOT NULL,
                PRIMARY KEY (chain_id, id)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_unscanned_height
             ON unscanned_records (chain_id, block_height);",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    /// Checkpoints of every chain in the database, ordered by chain id.
    pub async fn all_checkpoints(&self) -> Result<Vec<ScanCheckpoint>, ScanError> {
        let rows = sqlx::query(
            "SELECT chain_id, height, hash, updated_at FROM checkpoints ORDER BY chain_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(rows.iter().map(checkpoint_from_row).collect())
    }

    /// Number of scanned blocks kept for `chain_id`.
    pub async fn block_count(&self, chain_id: &str) -> Result<u64, ScanError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM blocks WHERE chain_id = ?")
            .bind(chain_id)
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;

        let cnt: i64 = row.get("cnt");
        Ok(cnt as u64)
    }

    /// Delete the checkpoint of `chain_id`, so the next cycle starts behind the tip.
    pub async fn delete_checkpoint(&self, chain_id: &str) -> Result<(), ScanError> {
        sqlx::query("DELETE FROM checkpoints WHERE chain_id = ?")
            .bind(chain_id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}

fn checkpoint_from_row(row: &SqliteRow) -> ScanCheckpoint {
    ScanCheckpoint {
        chain_id: row.get("chain_id"),
        height: row.get::<i64, _>("height") as u64,
        hash: row.get("hash"),
        updated_at: row.get("updated_at"),
    }
}

// ─── ScanCheckpointStore impl ────────────────────────────────────────────────

#[async_trait]
impl ScanCheckpointStore for SqliteStorage {
    async fn load_checkpoint(&self, chain_id: &str) -> Result<Option<ScanCheckpoint>, ScanError> {
        let row = sqlx::query(
            "SELECT chain_id, height, hash, updated_at FROM checkpoints WHERE chain_id = ?",
        )
        .bind(chain_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(row.as_ref().map(checkpoint_from_row))
    }

    async fn save_checkpoint(&self, checkpoint: ScanCheckpoint) -> Result<(), ScanError> {
        sqlx::query(
            "INSERT OR REPLACE INTO checkpoints (chain_id, height, hash, updated_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&checkpoint.chain_id)
        .bind(checkpoint.height as i64)
        .bind(&checkpoint.hash)
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        debug!(chain_id = %checkpoint.chain_id, height = checkpoint.height, "checkpoint saved");
        Ok(())
    }

    async fn save_block(&self, chain_id: &str, block: &Block) -> Result<(), ScanError> {
        let block_json = serde_json::to_string(block).map_err(storage_err)?;

        sqlx::query(
            "INSERT OR REPLACE INTO blocks (chain_id, height, hash, block_json)
             VALUES (?, ?, ?, ?)",
        )
        .bind(chain_id)
        .bind(block.height as i64)
        .bind(&block.hash)
        .bind(&block_json)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    async fn block_at_height(&self, chain_id: &str, height: u64) -> Result<Option<Block>, ScanError> {
        let row = sqlx::query("SELECT block_json FROM blocks WHERE chain_id = ? AND height = ?")
            .bind(chain_id)
            .bind(height as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;

        row.map(|r| {
            let json: String = r.get("block_json");
            serde_json::from_str(&json).map_err(storage_err)
        })
        .transpose()
    }

    async fn save_unscanned(&self, chain_id: &str, record: &UnscannedRecord) -> Result<(), ScanError> {
        sqlx::query(
            "INSERT OR REPLACE INTO unscanned_records (chain_id, id, block_height, tx_id, reason)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(chain_id)
        .bind(&record.id)
        .bind(record.block_height as i64)
        .bind(&record.tx_id)
        .bind(&record.reason)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    async fn all_unscanned(&self, chain_id: &str) -> Result<Vec<UnscannedRecord>, ScanError> {
        let rows = sqlx::query(
            "SELECT id, block_height, tx_id, reason FROM unscanned_records
             WHERE chain_id = ? ORDER BY block_height, id",
        )
        .bind(chain_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(rows
            .into_iter()
            .map(|r| UnscannedRecord {
                id: r.get("id"),
                block_height: r.get::<i64, _>("block_height") as u64,
                tx_id: r.get("tx_id"),
                reason: r.get("reason"),
            })
            .collect())
    }

    async fn delete_unscanned(&self, chain_id: &str, height: u64) -> Result<(), ScanError> {
        sqlx::query("DELETE FROM unscanned_records WHERE chain_id = ? AND block_height = ?")
            .bind(chain_id)
            .bind(height as i64)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        debug!(chain_id, height, "unscanned records deleted");
        Ok(())
    }

    async fn purge_unscanned_matching(&self, chain_id: &str, reason_prefix: &str) -> Result<u64, ScanError> {
        // substr instead of LIKE: the prefix may contain wildcard characters
        let result = sqlx::query(
            "DELETE FROM unscanned_records
             WHERE chain_id = ? AND substr(reason, 1, length(?)) = ?",
        )
        .bind(chain_id)
        .bind(reason_prefix)
        .bind(reason_prefix)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(result.rows_affected())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
