//! Dead Letter Queue implementation.
//!
//! Buffers failed records and writes them as NDJSON. Every flush goes to
//! its own object so earlier flushes are never overwritten.

use bytes::Bytes;
use chrono::Utc;
use snafu::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::config::ErrorHandlingConfig;
use crate::error::{DlqError, DlqSerializeSnafu, DlqStorageSnafu, DlqWriteSnafu};
use crate::storage::{StorageProvider, StorageProviderRef};

use super::types::{FailedRecord, FailureStats};

const DEFAULT_BUFFER_SIZE: usize = 100;

/// Dead Letter Queue shared by all stages of a run.
pub struct DeadLetterQueue {
    storage: StorageProviderRef,
    run_id: String,
    flushes: AtomicU64,
    buffer: Mutex<Vec<FailedRecord>>,
    stats: Mutex<FailureStats>,
    buffer_size: usize,
}

impl DeadLetterQueue {
    /// Create a DLQ from configuration.
    ///
    /// Returns `None` if no DLQ path is configured.
    pub async fn from_config(config: &ErrorHandlingConfig) -> Result<Option<Self>, DlqError> {
        let Some(dlq_path) = &config.dlq_path else {
            return Ok(None);
        };

        let storage =
            StorageProvider::create_with_options(dlq_path, config.dlq_storage_options.clone())
                .await
                .context(DlqStorageSnafu)?;

        info!(path = %dlq_path, "DLQ enabled");
        Ok(Some(Self::new(Arc::new(storage), DEFAULT_BUFFER_SIZE)))
    }

    pub fn new(storage: StorageProviderRef, buffer_size: usize) -> Self {
        Self {
            storage,
            run_id: Utc::now().format("%Y%m%d-%H%M%S").to_string(),
            flushes: AtomicU64::new(0),
            buffer: Mutex::new(Vec::new()),
            stats: Mutex::new(FailureStats::default()),
            buffer_size: buffer_size.max(1),
        }
    }

    /// Buffer a failure, flushing once the buffer is full.
    pub async fn record_failure(&self, failed: FailedRecord) {
        debug!(
            target = %failed.target,
            stage = failed.stage.as_str(),
            error = %failed.error,
            "Recording DLQ failure"
        );

        self.stats.lock().await.increment(failed.stage);

        let should_flush = {
            let mut buffer = self.buffer.lock().await;
            buffer.push(failed);
            buffer.len() >= self.buffer_size
        };

        if should_flush {
            if let Err(e) = self.flush().await {
                error!(error = %e, "Failed to flush DLQ");
            }
        }
    }

    /// Write buffered records to a new object.
    pub async fn flush(&self) -> Result<(), DlqError> {
        let records = {
            let mut buffer = self.buffer.lock().await;
            if buffer.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut *buffer)
        };

        let mut ndjson = String::new();
        for record in &records {
            let line = serde_json::to_string(record).context(DlqSerializeSnafu)?;
            ndjson.push_str(&line);
            ndjson.push('\n');
        }

        let seq = self.flushes.fetch_add(1, Ordering::Relaxed);
        let filename = format!("failures-{}-{seq:04}.ndjson", self.run_id);
        self.storage
            .put(&filename, Bytes::from(ndjson))
            .await
            .context(DlqWriteSnafu)?;

        info!(file = %filename, count = records.len(), "Flushed DLQ records");
        Ok(())
    }

    /// Flush remaining records and log totals.
    pub async fn finalize(&self) -> Result<(), DlqError> {
        self.flush().await?;
        let stats = *self.stats.lock().await;
        info!(
            total = stats.total(),
            decode = stats.decode,
            merge = stats.merge,
            "DLQ finalized"
        );
        Ok(())
    }

    pub async fn stats(&self) -> FailureStats {
        *self.stats.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn config(path: Option<String>) -> ErrorHandlingConfig {
        ErrorHandlingConfig {
            max_failures: 0,
            dlq_path: path,
            dlq_storage_options: HashMap::new(),
        }
    }

    fn read_all(dir: &std::path::Path) -> Vec<String> {
        let mut files: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect();
        files.sort();
        files
            .iter()
            .flat_map(|p| {
                std::fs::read_to_string(p)
                    .unwrap()
                    .lines()
                    .map(String::from)
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_dlq_from_config_none_when_no_path() {
        let dlq = DeadLetterQueue::from_config(&config(None)).await.unwrap();
        assert!(dlq.is_none());
    }

    #[tokio::test]
    async fn test_dlq_creates_missing_directory() {
        let temp_dir = TempDir::new().unwrap();
        let dlq_dir = temp_dir.path().join("dlq").join("bookings");

        let dlq = DeadLetterQueue::from_config(&config(Some(dlq_dir.to_str().unwrap().into())))
            .await
            .unwrap()
            .unwrap();
        dlq.record_failure(FailedRecord::decode("bookings", "a.ndjson", 1, "bad", "{"))
            .await;
        dlq.finalize().await.unwrap();

        assert_eq!(read_all(&dlq_dir).len(), 1);
    }

    #[tokio::test]
    async fn test_flushes_never_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let storage = StorageProvider::for_url_with_options(
            temp_dir.path().to_str().unwrap(),
            HashMap::new(),
        )
        .await
        .unwrap();
        let dlq = DeadLetterQueue::new(Arc::new(storage), 2);

        for i in 0..5 {
            dlq.record_failure(FailedRecord::decode(
                "bookings",
                "a.ndjson",
                i + 1,
                "EOF while parsing",
                "{",
            ))
            .await;
        }
        dlq.finalize().await.unwrap();

        let files = std::fs::read_dir(temp_dir.path()).unwrap().count();
        assert_eq!(files, 3);

        let lines = read_all(temp_dir.path());
        assert_eq!(lines.len(), 5);
        for line in lines {
            let record: serde_json::Value = serde_json::from_str(&line).unwrap();
            assert_eq!(record["stage"], "decode");
            assert!(record.get("timestamp").is_some());
        }
    }

    #[tokio::test]
    async fn test_stats_by_stage() {
        let storage = StorageProvider::for_url_with_options("memory://", HashMap::new())
            .await
            .unwrap();
        let dlq = DeadLetterQueue::new(Arc::new(storage), 100);

        dlq.record_failure(FailedRecord::decode("flights", "f.ndjson", 3, "bad", "x"))
            .await;
        dlq.record_failure(FailedRecord::merge(
            "flights",
            "missing natural key (flight_id)",
            serde_json::json!({}),
        ))
        .await;

        let stats = dlq.stats().await;
        assert_eq!(stats.decode, 1);
        assert_eq!(stats.merge, 1);
    }
}
