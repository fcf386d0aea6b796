//! The height-advancing scan loop with fork recovery and the retry pass.
//!
//! A scan cycle walks from the checkpoint towards the remote tip one block
//! at a time:
//!
//! ```text
//! tip? ─► hash(h+1) ─► block ─► parent == checkpoint hash?
//!                                 ├─ yes: extract, save block, save checkpoint, notify header
//!                                 └─ no:  notify fork header, rewind, resume
//! ```
//!
//! After the forward walk the last few heights are re-extracted and
//! previously failed heights are retried.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{watch, Mutex};

use crate::batch::BatchExtractor;
use crate::checkpoint::{CheckpointManager, ScanCheckpointStore};
use crate::config::ScannerConfig;
use crate::error::ScanError;
use crate::extract::ExtractionEngine;
use crate::filter::{AddressFilter, RejectAll};
use crate::observer::{ObserverRegistry, ScanObserver};
use crate::record::ExtractedData;
use crate::source::ChainSource;
use crate::types::{Block, BlockHeader, UnscannedRecord};

/// Position of the forward walk.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScanCursor {
    height: u64,
    hash: String,
}

impl ScanCursor {
    fn advance(&mut self, height: u64, hash: impl Into<String>) {
        self.height = height;
        self.hash = hash.into();
    }

    fn next_height(&self) -> u64 {
        self.height + 1
    }
}

/// Block scanner for one chain.
///
/// All store writes (scan cycles, the retry pass, on-demand scans and
/// rescan-height resets) go through a single writer lock, so they never
/// interleave.
pub struct Scanner {
    config: ScannerConfig,
    source: Arc<dyn ChainSource>,
    checkpoint: CheckpointManager,
    batch: BatchExtractor,
    observers: Arc<ObserverRegistry>,
    filter: RwLock<Arc<dyn AddressFilter>>,
    scanning: AtomicBool,
    writer: Mutex<()>,
}

impl Scanner {
    pub fn new(config: ScannerConfig, source: Arc<dyn ChainSource>, store: Arc<dyn ScanCheckpointStore>) -> Self {
        let checkpoint = CheckpointManager::new(store, config.chain_id.clone());
        let observers = Arc::new(ObserverRegistry::new());
        let engine = Arc::new(ExtractionEngine::new(source.clone(), &config));
        let batch = BatchExtractor::new(
            engine,
            config.max_extracting_size,
            observers.clone(),
            checkpoint.clone(),
        );
        Self {
            config,
            source,
            checkpoint,
            batch,
            observers,
            filter: RwLock::new(Arc::new(RejectAll)),
            scanning: AtomicBool::new(false),
            writer: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    pub fn checkpoint(&self) -> &CheckpointManager {
        &self.checkpoint
    }

    /// Install the address filter used by subsequent scans.
    pub fn set_address_filter(&self, filter: Arc<dyn AddressFilter>) {
        *self.filter.write().unwrap_or_else(|e| e.into_inner()) = filter;
    }

    fn address_filter(&self) -> Arc<dyn AddressFilter> {
        self.filter.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn add_observer(&self, observer: Arc<dyn ScanObserver>) {
        self.observers.add(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn ScanObserver>) {
        self.observers.remove(observer);
    }

    pub fn start(&self) {
        self.scanning.store(true, Ordering::SeqCst);
    }

    /// Stop scanning. Takes effect at the next height boundary.
    pub fn stop(&self) {
        self.scanning.store(false, Ordering::SeqCst);
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    // ─── Scan cycle ───────────────────────────────────────────────────────────

    /// Scan forward until caught up with the tip, halted, or stopped, then
    /// re-extract the tail and retry failed heights.
    ///
    /// Returns the forward walk's halting error, if any. A storage error
    /// aborts the cycle before the tail rescan and the retry pass; their
    /// other failures are logged.
    pub async fn run_scan_cycle(&self) -> Result<(), ScanError> {
        let _writer = self.writer.lock().await;
        let filter = self.address_filter();

        let mut cursor = self.load_cursor().await?;
        let forward = self.scan_forward(&mut cursor, &filter).await;
        if let Err(e) = &forward {
            if e.is_persistence() {
                tracing::error!(height = cursor.height, error = %e, "scan cycle aborted");
            } else {
                tracing::warn!(height = cursor.height, error = %e, "scan cycle halted");
            }
        }
        if matches!(&forward, Err(e) if e.is_persistence()) {
            return forward;
        }

        self.rescan_tail(cursor.height, &filter).await?;

        match self.retry_failed(&filter).await {
            Err(e) if e.is_persistence() => return Err(e),
            Err(e) => tracing::error!(error = %e, "retry pass failed"),
            Ok(()) => {}
        }
        forward
    }

    async fn load_cursor(&self) -> Result<ScanCursor, ScanError> {
        if let Some(cp) = self.checkpoint.load().await? {
            return Ok(ScanCursor {
                height: cp.height,
                hash: cp.hash,
            });
        }
        let tip = self.source.tip_height().await?;
        let height = tip.saturating_sub(1);
        let hash = self.source.block_hash(height).await?;
        tracing::info!(height, hash = %hash, "no checkpoint; starting one block behind the tip");
        Ok(ScanCursor { height, hash })
    }

    async fn scan_forward(&self, cursor: &mut ScanCursor, filter: &Arc<dyn AddressFilter>) -> Result<(), ScanError> {
        let mut fetch_failures = 0u32;

        while self.is_scanning() {
            let tip = self.source.tip_height().await?;
            if cursor.height >= tip {
                tracing::debug!(height = cursor.height, tip, "caught up with the tip");
                return Ok(());
            }

            let next = cursor.next_height();
            let hash = self.source.block_hash(next).await?;
            let block = match self.source.block_by_hash(&hash).await {
                Ok(block) => {
                    fetch_failures = 0;
                    block
                }
                Err(e) => {
                    fetch_failures += 1;
                    tracing::warn!(height = next, attempt = fetch_failures, error = %e, "block fetch failed");
                    self.checkpoint
                        .record_unscanned(UnscannedRecord::new(next, "", e.reason()))
                        .await?;
                    if fetch_failures >= self.config.max_fetch_failures {
                        return Err(e);
                    }
                    continue;
                }
            };

            if !block.extends(&cursor.hash) {
                self.roll_back(cursor, next, &block).await?;
                continue;
            }

            tracing::info!(height = next, hash = %block.hash, txs = block.transactions.len(), "scanning block");
            self.extract_block(next, &block, filter).await?;

            self.checkpoint.save_block(&block).await?;
            self.checkpoint.save(next, &block.hash).await?;
            cursor.advance(next, block.hash.clone());

            if let Err(e) = self.observers.notify_header(&block.header(&self.config.symbol, false)).await {
                tracing::warn!(height = next, error = %e, "new block notification failed");
            }
        }

        tracing::info!(height = cursor.height, "scanning stopped");
        Ok(())
    }

    /// Undo the block at the cursor after `remote` (at `next`) failed to extend it.
    async fn roll_back(&self, cursor: &mut ScanCursor, next: u64, remote: &Block) -> Result<(), ScanError> {
        tracing::warn!(
            height = cursor.height,
            local_hash = %cursor.hash,
            remote_parent = %remote.previous_hash,
            "fork detected"
        );

        let dropped = match self.checkpoint.block_at_height(cursor.height).await? {
            Some(block) => block.header(&self.config.symbol, true),
            None => BlockHeader {
                height: cursor.height,
                hash: cursor.hash.clone(),
                previous_hash: String::new(),
                merkle_root: String::new(),
                time: 0,
                symbol: self.config.symbol.clone(),
                fork: true,
            },
        };
        if let Err(e) = self.observers.notify_header(&dropped).await {
            tracing::warn!(height = cursor.height, error = %e, "fork notification failed");
        }

        self.checkpoint.delete_unscanned(cursor.height).await?;

        let depth = self.config.rewind_depth();
        // Always land strictly below the dropped block, down to genesis when
        // the fork is at height 1.
        let rewound = next
            .saturating_sub(depth)
            .max(1)
            .min(cursor.height.saturating_sub(1));
        // Local blocks at or above the dropped height, or carrying the
        // dropped hash, are stale; ask the node instead.
        let local = if rewound < cursor.height {
            self.checkpoint
                .block_at_height(rewound)
                .await?
                .filter(|block| block.hash != cursor.hash)
        } else {
            None
        };
        let hash = match local {
            Some(block) => block.hash,
            None => self.source.block_hash(rewound).await?,
        };
        self.checkpoint.save(rewound, &hash).await?;

        tracing::warn!(
            from = cursor.height,
            to = rewound,
            depth,
            "checkpoint rewound; reorgs deeper than the rewind depth are not recovered"
        );
        cursor.advance(rewound, hash);
        Ok(())
    }

    /// Re-extract heights `[current - rescan_last_block_count, current)`.
    /// Only storage errors are returned.
    async fn rescan_tail(&self, current: u64, filter: &Arc<dyn AddressFilter>) -> Result<(), ScanError> {
        let from = current.saturating_sub(self.config.rescan_last_block_count);
        for height in (from..current).filter(|h| *h > 0) {
            tracing::debug!(height, "rescanning tail block");
            match self.extract_height(height, filter).await {
                Err(e) if e.is_persistence() => return Err(e),
                Err(e) => tracing::warn!(height, error = %e, "tail rescan failed"),
                Ok(_) => {}
            }
        }
        Ok(())
    }

    /// Fetch the block at `height` and extract it. Fetch failures are queued
    /// as unscanned records.
    async fn extract_height(&self, height: u64, filter: &Arc<dyn AddressFilter>) -> Result<Block, ScanError> {
        let hash = self.source.block_hash(height).await?;
        let block = match self.source.block_by_hash(&hash).await {
            Ok(block) => block,
            Err(e) => {
                self.checkpoint
                    .record_unscanned(UnscannedRecord::new(height, "", e.reason()))
                    .await?;
                return Err(e);
            }
        };

        self.extract_block(height, &block, filter).await?;
        Ok(block)
    }

    /// Run the batch extractor over a fetched block. Extraction failures are
    /// already queued for retry and only logged; a storage error is returned
    /// so the caller does not record the block as scanned.
    async fn extract_block(&self, height: u64, block: &Block, filter: &Arc<dyn AddressFilter>) -> Result<(), ScanError> {
        if block.transactions.is_empty() {
            return Ok(());
        }
        match self
            .batch
            .extract_block(height, &block.hash, block.transactions.clone(), filter.clone())
            .await
        {
            Err(e) if e.is_persistence() => Err(e),
            Err(e) => {
                tracing::warn!(height, error = %e, "block extracted with failures; queued for retry");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    // ─── Retry pass ───────────────────────────────────────────────────────────

    /// Retry every height with unscanned records, then purge records the
    /// node will never resolve.
    pub async fn rescan_failed_records(&self) -> Result<(), ScanError> {
        let _writer = self.writer.lock().await;
        let filter = self.address_filter();
        self.retry_failed(&filter).await
    }

    async fn retry_failed(&self, filter: &Arc<dyn AddressFilter>) -> Result<(), ScanError> {
        let heights: BTreeSet<u64> = self
            .checkpoint
            .unscanned()
            .await?
            .iter()
            .map(|r| r.block_height)
            .filter(|h| *h > 0)
            .collect();

        for height in heights {
            tracing::info!(height, "retrying failed height");
            let block = match self.fetch_block(height).await {
                Ok(block) => block,
                Err(e) => {
                    tracing::warn!(height, error = %e, "retry fetch failed; keeping records");
                    continue;
                }
            };

            if !block.transactions.is_empty() {
                match self
                    .batch
                    .extract_block(height, &block.hash, block.transactions, filter.clone())
                    .await
                {
                    Err(e) if e.is_persistence() => return Err(e),
                    Err(e) => {
                        tracing::warn!(height, error = %e, "retry extraction failed; keeping records");
                        continue;
                    }
                    Ok(()) => {}
                }
            }
            self.checkpoint.delete_unscanned(height).await?;
        }

        let purged = self
            .checkpoint
            .purge_unscanned_matching(&self.config.not_found_reason)
            .await?;
        if purged > 0 {
            tracing::info!(purged, "purged unscanned records for unknown transactions");
        }
        Ok(())
    }

    async fn fetch_block(&self, height: u64) -> Result<Block, ScanError> {
        let hash = self.source.block_hash(height).await?;
        self.source.block_by_hash(&hash).await
    }

    // ─── On-demand operations ─────────────────────────────────────────────────

    /// Extract the block at `height` and notify its header, without moving
    /// the checkpoint.
    pub async fn scan_block(&self, height: u64) -> Result<(), ScanError> {
        let _writer = self.writer.lock().await;
        let filter = self.address_filter();
        let block = self.extract_height(height, &filter).await?;
        if let Err(e) = self.observers.notify_header(&block.header(&self.config.symbol, false)).await {
            tracing::warn!(height, error = %e, "new block notification failed");
        }
        Ok(())
    }

    /// Make the next cycle resume scanning at `height`.
    pub async fn set_rescan_height(&self, height: u64) -> Result<(), ScanError> {
        if height == 0 {
            return Err(ScanError::InvalidHeight(height));
        }
        let target = height - 1;
        let hash = self.source.block_hash(target).await?;

        let _writer = self.writer.lock().await;
        self.checkpoint.save(target, &hash).await?;
        tracing::info!(height, "rescan height set");
        Ok(())
    }

    /// Extract a single transaction by id, whether mined or still pending.
    /// Returns the extracted data grouped by source key.
    pub async fn extract_transaction_by_tx_id(
        &self,
        tx_id: &str,
        filter: &dyn AddressFilter,
    ) -> Result<BTreeMap<String, Vec<ExtractedData>>, ScanError> {
        let tx = self
            .source
            .tx_by_hash(tx_id)
            .await?
            .ok_or_else(|| ScanError::TxNotFound(tx_id.to_string()))?;

        let result = self.batch.engine().extract(0, "", Some(&tx), filter).await;
        if !result.success {
            return Err(ScanError::Extraction {
                tx_id: tx_id.to_string(),
                reason: result.failure.unwrap_or_default(),
            });
        }

        let mut grouped: BTreeMap<String, Vec<ExtractedData>> = BTreeMap::new();
        for (source_key, data) in result.extracted {
            grouped.entry(source_key).or_default().push(data);
        }
        Ok(grouped)
    }

    // ─── Height queries ───────────────────────────────────────────────────────

    /// Header of the last scanned block. Without a checkpoint, the block one
    /// behind the remote tip.
    pub async fn scanned_block_header(&self) -> Result<BlockHeader, ScanError> {
        let cursor = self.load_cursor().await?;
        let block = match self.checkpoint.block_at_height(cursor.height).await? {
            Some(block) => block,
            None => self.source.block_by_height(cursor.height).await?,
        };
        Ok(block.header(&self.config.symbol, false))
    }

    /// Header of the remote tip.
    pub async fn current_block_header(&self) -> Result<BlockHeader, ScanError> {
        let tip = self.source.tip_height().await?;
        let block = self.source.block_by_height(tip).await?;
        Ok(block.header(&self.config.symbol, false))
    }

    /// Remote tip height, or 0 if the source is unreachable.
    pub async fn global_max_block_height(&self) -> u64 {
        match self.source.tip_height().await {
            Ok(tip) => tip,
            Err(e) => {
                tracing::warn!(error = %e, "failed to query tip height");
                0
            }
        }
    }

    // ─── Background driver ────────────────────────────────────────────────────

    /// Run scan cycles every `poll_interval_ms` until `shutdown` turns true
    /// or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        self.start();
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        tracing::info!(chain = %self.config.chain_id, interval_ms = self.config.poll_interval_ms, "scanner started");

        while !*shutdown.borrow() {
            if let Err(e) = self.run_scan_cycle().await {
                tracing::warn!(error = %e, "scan cycle ended with error");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.stop();
        tracing::info!(chain = %self.config.chain_id, "scanner stopped");
    }
}
