//! Concurrent extraction of all transactions in a block.
//!
//! Each transaction runs in its own task, but only `max_extracting_size`
//! of them hold an admission permit at any time. The semaphore is shared by
//! every block this extractor handles, so the bound is global to the scanner.
//! Results are merged by a single consumer, the only place that notifies
//! observers or writes unscanned records for this block.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{mpsc, Semaphore};

use crate::checkpoint::CheckpointManager;
use crate::error::ScanError;
use crate::extract::ExtractionEngine;
use crate::filter::AddressFilter;
use crate::observer::ObserverRegistry;
use crate::record::ExtractResult;
use crate::types::{Tx, UnscannedRecord};

pub struct BatchExtractor {
    engine: Arc<ExtractionEngine>,
    admission: Arc<Semaphore>,
    observers: Arc<ObserverRegistry>,
    checkpoint: CheckpointManager,
}

impl BatchExtractor {
    pub fn new(
        engine: Arc<ExtractionEngine>,
        max_extracting_size: usize,
        observers: Arc<ObserverRegistry>,
        checkpoint: CheckpointManager,
    ) -> Self {
        Self {
            engine,
            admission: Arc::new(Semaphore::new(max_extracting_size.max(1))),
            observers,
            checkpoint,
        }
    }

    pub fn engine(&self) -> &Arc<ExtractionEngine> {
        &self.engine
    }

    /// Extract every transaction of the block at `height` and deliver the results.
    ///
    /// Returns once every transaction has completed. Failed extractions and
    /// failed deliveries are queued as unscanned records for `height`; the
    /// returned [`ScanError::BatchIncomplete`] is advisory. A
    /// [`ScanError::Storage`] means a failure could not be queued and the
    /// block must not be treated as scanned.
    pub async fn extract_block(
        &self,
        height: u64,
        block_hash: &str,
        txs: Vec<Tx>,
        filter: Arc<dyn AddressFilter>,
    ) -> Result<(), ScanError> {
        if txs.is_empty() {
            return Err(ScanError::EmptyBlock { height });
        }

        let total = txs.len();
        let (sender, results) = mpsc::unbounded_channel::<ExtractResult>();

        let handles: Vec<_> = txs
            .into_iter()
            .map(|tx| {
                let engine = self.engine.clone();
                let admission = self.admission.clone();
                let filter = filter.clone();
                let sender = sender.clone();
                let block_hash = block_hash.to_string();
                tokio::spawn(async move {
                    let result = match admission.acquire_owned().await {
                        Ok(_permit) => engine.extract(height, &block_hash, Some(&tx), filter.as_ref()).await,
                        Err(e) => ExtractResult::failed(&tx.hash, height, e.to_string()),
                    };
                    // The consumer only stops early when every sender is gone.
                    let _ = sender.send(result);
                })
            })
            .collect();
        drop(sender);

        let (failed, persist_err) = self.merge_results(height, total, results).await;

        for joined in join_all(handles).await {
            if let Err(e) = joined {
                tracing::error!(height, error = %e, "extraction task aborted");
            }
        }

        if let Some(e) = persist_err {
            return Err(e);
        }
        if failed > 0 {
            return Err(ScanError::BatchIncomplete { height, failed, total });
        }
        tracing::debug!(height, total, "block extracted");
        Ok(())
    }

    /// Single consumer: waits for exactly `total` results (or for every
    /// producer to vanish) and returns how many did not make it through,
    /// along with the first error hit while queueing them for retry.
    async fn merge_results(
        &self,
        height: u64,
        total: usize,
        mut results: mpsc::UnboundedReceiver<ExtractResult>,
    ) -> (usize, Option<ScanError>) {
        let mut done = 0;
        let mut failed = 0;
        let mut persist_err = None;

        while done < total {
            let Some(result) = results.recv().await else {
                break;
            };
            done += 1;
            if let Err(reason) = self.deliver(&result).await {
                tracing::warn!(height, tx_id = %result.tx_id, %reason, "transaction not delivered");
                failed += 1;
                if let Err(e) = self.queue_retry(height, reason).await {
                    persist_err.get_or_insert(e);
                }
            }
        }

        if done < total {
            let missing = total - done;
            failed += missing;
            if let Err(e) = self
                .queue_retry(height, format!("{missing} extraction tasks ended without a result"))
                .await
            {
                persist_err.get_or_insert(e);
            }
        }
        (failed, persist_err)
    }

    async fn deliver(&self, result: &ExtractResult) -> Result<(), String> {
        if !result.success {
            return Err(result
                .failure
                .clone()
                .unwrap_or_else(|| "extraction failed".to_string()));
        }

        let mut first_err = None;
        for (source_key, data) in &result.extracted {
            if let Err(e) = self.observers.notify_extracted(source_key, data).await {
                first_err.get_or_insert(e.reason());
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    async fn queue_retry(&self, height: u64, reason: String) -> Result<(), ScanError> {
        self.checkpoint
            .record_unscanned(UnscannedRecord::new(height, "", reason))
            .await
            .map_err(|e| {
                tracing::error!(height, error = %e, "failed to persist unscanned record");
                e
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::checkpoint::{MemoryCheckpointStore, ScanCheckpoint, ScanCheckpointStore};
    use crate::config::ScannerConfig;
    use crate::observer::ScanObserver;
    use crate::record::ExtractedData;
    use crate::source::ChainSource;
    use crate::testutil::{native_tx, token_record, token_tx, watch, MockSource};
    use crate::types::{Block, BlockHeader};

    /// Store that accepts everything except unscanned records.
    #[derive(Default)]
    struct FullDisk(MemoryCheckpointStore);

    #[async_trait]
    impl ScanCheckpointStore for FullDisk {
        async fn load_checkpoint(&self, chain_id: &str) -> Result<Option<ScanCheckpoint>, ScanError> {
            self.0.load_checkpoint(chain_id).await
        }
        async fn save_checkpoint(&self, checkpoint: ScanCheckpoint) -> Result<(), ScanError> {
            self.0.save_checkpoint(checkpoint).await
        }
        async fn save_block(&self, chain_id: &str, block: &Block) -> Result<(), ScanError> {
            self.0.save_block(chain_id, block).await
        }
        async fn block_at_height(&self, chain_id: &str, height: u64) -> Result<Option<Block>, ScanError> {
            self.0.block_at_height(chain_id, height).await
        }
        async fn save_unscanned(&self, _chain_id: &str, _record: &UnscannedRecord) -> Result<(), ScanError> {
            Err(ScanError::Storage("disk full".into()))
        }
        async fn all_unscanned(&self, chain_id: &str) -> Result<Vec<UnscannedRecord>, ScanError> {
            self.0.all_unscanned(chain_id).await
        }
        async fn delete_unscanned(&self, chain_id: &str, height: u64) -> Result<(), ScanError> {
            self.0.delete_unscanned(chain_id, height).await
        }
        async fn purge_unscanned_matching(&self, chain_id: &str, reason_prefix: &str) -> Result<u64, ScanError> {
            self.0.purge_unscanned_matching(chain_id, reason_prefix).await
        }
    }

    #[derive(Default)]
    struct Recorder {
        data: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ScanObserver for Recorder {
        async fn on_new_header(&self, _h: &BlockHeader) -> Result<(), ScanError> {
            Ok(())
        }

        async fn on_extracted_data(&self, _k: &str, _d: &ExtractedData) -> Result<(), ScanError> {
            self.data.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ScanError::Notification {
                    reason: "wallet offline".into(),
                });
            }
            Ok(())
        }
    }

    fn extractor(source: Arc<MockSource>, limit: usize, observer: Arc<Recorder>) -> (BatchExtractor, CheckpointManager) {
        let source: Arc<dyn ChainSource> = source;
        let engine = Arc::new(ExtractionEngine::new(source, &ScannerConfig::default()));
        let observers = Arc::new(ObserverRegistry::new());
        observers.add(observer);
        let checkpoint = CheckpointManager::new(Arc::new(MemoryCheckpointStore::new()), "nuls");
        (
            BatchExtractor::new(engine, limit, observers, checkpoint.clone()),
            checkpoint,
        )
    }

    #[tokio::test]
    async fn empty_block_is_rejected() {
        let (batch, _) = extractor(Arc::new(MockSource::default()), 4, Arc::new(Recorder::default()));
        let err = batch
            .extract_block(5, "h5", vec![], Arc::new(watch(&[])))
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::EmptyBlock { height: 5 }));
    }

    #[tokio::test]
    async fn every_transaction_is_delivered() {
        let recorder = Arc::new(Recorder::default());
        let (batch, checkpoint) = extractor(Arc::new(MockSource::default()), 3, recorder.clone());
        let txs: Vec<_> = (0..12)
            .map(|i| native_tx(&format!("tx{i}"), 50, &[("alice", 10)], &[("bob", 9, 0)]))
            .collect();

        batch
            .extract_block(50, "h50", txs, Arc::new(watch(&[("alice", "a"), ("bob", "b")])))
            .await
            .unwrap();

        // two source keys per transaction
        assert_eq!(recorder.data.load(Ordering::SeqCst), 24);
        assert!(checkpoint.unscanned().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failures_are_queued_for_retry() {
        let recorder = Arc::new(Recorder::default());
        let (batch, checkpoint) = extractor(Arc::new(MockSource::default()), 2, recorder.clone());
        // no token records registered, so every lookup returns zero records
        let txs: Vec<_> = (0..5).map(|i| token_tx(&format!("t{i}"), 60)).collect();

        let err = batch
            .extract_block(60, "h60", txs, Arc::new(watch(&[])))
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::BatchIncomplete { failed: 5, total: 5, .. }));

        let unscanned = checkpoint.unscanned().await.unwrap();
        assert_eq!(unscanned.len(), 1);
        assert_eq!(unscanned[0].block_height, 60);
        assert_eq!(unscanned[0].tx_id, "");
        assert_eq!(recorder.data.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unqueued_failure_is_a_storage_error() {
        let source: Arc<dyn ChainSource> = Arc::new(MockSource::default());
        let engine = Arc::new(ExtractionEngine::new(source, &ScannerConfig::default()));
        let recorder = Arc::new(Recorder::default());
        let observers = Arc::new(ObserverRegistry::new());
        observers.add(recorder.clone());
        let checkpoint = CheckpointManager::new(Arc::new(FullDisk::default()), "nuls");
        let batch = BatchExtractor::new(engine, 2, observers, checkpoint);

        // one good transfer, one token tx whose lookup finds nothing
        let txs = vec![
            native_tx("tx", 21, &[("alice", 10)], &[]),
            token_tx("t0", 21),
        ];
        let err = batch
            .extract_block(21, "h21", txs, Arc::new(watch(&[("alice", "a")])))
            .await
            .unwrap_err();

        assert!(err.is_persistence(), "{err}");
        assert_eq!(recorder.data.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn observer_failure_counts_as_failed() {
        let recorder = Arc::new(Recorder {
            fail: true,
            ..Default::default()
        });
        let (batch, checkpoint) = extractor(Arc::new(MockSource::default()), 2, recorder);
        let txs = vec![native_tx("tx", 70, &[("alice", 10)], &[])];

        let err = batch
            .extract_block(70, "h70", txs, Arc::new(watch(&[("alice", "a")])))
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::BatchIncomplete { failed: 1, .. }));
        assert!(checkpoint.unscanned().await.unwrap()[0]
            .reason
            .contains("wallet offline"));
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_limit() {
        let mut source = MockSource::default();
        source.token_delay = Duration::from_millis(20);
        let source = Arc::new(source);
        for i in 0..16 {
            let hash = format!("t{i}");
            source
                .tokens
                .lock()
                .unwrap()
                .insert(hash.clone(), vec![token_record(&hash, "alice", "bob", "100")]);
        }
        let (batch, _) = extractor(source.clone(), 3, Arc::new(Recorder::default()));
        let txs: Vec<_> = (0..16).map(|i| token_tx(&format!("t{i}"), 80)).collect();

        batch
            .extract_block(80, "h80", txs, Arc::new(watch(&[("bob", "b")])))
            .await
            .unwrap();

        let peak = source.max_in_flight.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak concurrency {peak}");
        assert!(peak >= 1);
    }
}
