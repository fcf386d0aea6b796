//! Scan observer trait + registry.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::error::ScanError;
use crate::record::ExtractedData;
use crate::types::BlockHeader;

/// Receives block and extraction notifications from the scanner.
///
/// Typically implemented by the wallet layer that books the extracted records.
#[async_trait]
pub trait ScanObserver: Send + Sync {
    /// Called once per scanned block, and with `header.fork == true` for a
    /// block dropped by a fork rollback.
    async fn on_new_header(&self, header: &BlockHeader) -> Result<(), ScanError>;

    /// Called once per source key for every successfully extracted transaction.
    async fn on_extracted_data(&self, source_key: &str, data: &ExtractedData) -> Result<(), ScanError>;
}

/// Fan-out of notifications to zero or more observers.
///
/// Observers can be added and removed while a scan is running; a dispatch
/// works on a snapshot taken when it starts.
#[derive(Default)]
pub struct ObserverRegistry {
    observers: RwLock<Vec<Arc<dyn ScanObserver>>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer. Registering the same `Arc` twice is a no-op.
    pub fn add(&self, observer: Arc<dyn ScanObserver>) {
        let mut observers = self.observers.write().unwrap_or_else(|e| e.into_inner());
        if !observers.iter().any(|o| Arc::ptr_eq(o, &observer)) {
            observers.push(observer);
        }
    }

    /// Remove a previously registered observer (matched by pointer identity).
    pub fn remove(&self, observer: &Arc<dyn ScanObserver>) {
        self.observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|o| !Arc::ptr_eq(o, observer));
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<dyn ScanObserver>> {
        self.observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Notify every observer of a header. All observers are called even if
    /// one fails; the first error is returned.
    pub async fn notify_header(&self, header: &BlockHeader) -> Result<(), ScanError> {
        let mut first_err = None;
        for observer in self.snapshot() {
            if let Err(e) = observer.on_new_header(header).await {
                tracing::warn!(height = header.height, fork = header.fork, error = %e, "header notification failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Notify every observer of one source key's extracted data.
    pub async fn notify_extracted(&self, source_key: &str, data: &ExtractedData) -> Result<(), ScanError> {
        let mut first_err = None;
        for observer in self.snapshot() {
            if let Err(e) = observer.on_extracted_data(source_key, data).await {
                tracing::warn!(source_key, error = %e, "extracted data notification failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
