//! Raw-zone stream source.
//!
//! A source lists NDJSON files under a location, skips everything its
//! offsets mark as consumed, and decodes the next bounded batch of lines.
//! The source itself is stateless between polls: the caller owns the
//! offsets and persists them together with the batch output.

mod offsets;
mod reader;

pub use offsets::{FileReadState, SourceOffsets};
pub use reader::{MalformedLine, NdjsonReader, ReadResult, SourceSchema};

use snafu::prelude::*;
use std::collections::HashMap;
use tracing::debug;

use crate::emit;
use crate::error::{ParseTaskSnafu, SourceError, SourceListSnafu, SourceOpenSnafu, SourceReadSnafu};
use crate::metrics::events::{BytesRead, PendingFiles, RecordsRead};
use crate::storage::{StorageProvider, StorageProviderRef};
use crate::value::Record;

const EXTENSIONS: &[&str] = &[".json", ".jsonl", ".ndjson"];

/// A malformed line together with the file it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedRecord {
    pub file: String,
    pub line: usize,
    pub error: String,
    pub raw: String,
}

/// One polled batch.
#[derive(Debug, Default)]
pub struct SourceBatch {
    pub records: Vec<Record>,
    pub malformed: Vec<MalformedRecord>,
    /// Records with at least one field moved to `_rescued_data`.
    pub rescued: usize,
    /// Offsets after this batch. Persist them only with the batch output.
    pub offsets: SourceOffsets,
}

impl SourceBatch {
    /// Whether the batch carries no records and no malformed lines.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.malformed.is_empty()
    }
}

/// Source over a raw-zone location.
pub struct RawSource {
    name: String,
    url: String,
    storage_options: HashMap<String, String>,
    storage: Option<StorageProviderRef>,
    reader: NdjsonReader,
}

impl RawSource {
    /// Create a source that opens its location on first poll.
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        storage_options: HashMap<String, String>,
        reader: NdjsonReader,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            storage_options,
            storage: None,
            reader,
        }
    }

    /// Create a source and open its location immediately.
    pub async fn open(
        name: impl Into<String>,
        url: impl Into<String>,
        storage_options: HashMap<String, String>,
        reader: NdjsonReader,
    ) -> Result<Self, SourceError> {
        let mut source = Self::new(name, url, storage_options, reader);
        source.storage().await?;
        Ok(source)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn storage(&mut self) -> Result<StorageProviderRef, SourceError> {
        if let Some(storage) = &self.storage {
            return Ok(storage.clone());
        }
        let storage =
            StorageProvider::for_url_with_options(&self.url, self.storage_options.clone())
                .await
                .context(SourceOpenSnafu { url: &self.url })?;
        let storage = std::sync::Arc::new(storage);
        self.storage = Some(storage.clone());
        Ok(storage)
    }

    /// List readable files, sorted lexicographically.
    pub async fn list_files(&mut self) -> Result<Vec<String>, SourceError> {
        let storage = self.storage().await?;
        let objects = storage.list(None).await.context(SourceListSnafu)?;
        Ok(objects
            .into_iter()
            .map(|o| o.path)
            .filter(|path| is_data_file(path))
            .collect())
    }

    /// Read up to `max_records` lines past `offsets`.
    pub async fn poll_batch(
        &mut self,
        offsets: &SourceOffsets,
        max_records: usize,
    ) -> Result<SourceBatch, SourceError> {
        let storage = self.storage().await?;
        let files = self.list_files().await?;
        let pending = offsets.pending(&files);

        let mut batch = SourceBatch {
            offsets: offsets.clone(),
            ..Default::default()
        };
        let mut remaining = max_records.max(1);
        let mut still_pending = pending.len();

        for path in pending {
            if remaining == 0 {
                break;
            }
            let skip = offsets.lines_to_skip(path);
            let bytes = storage.get(path).await.context(SourceReadSnafu { path })?;
            emit!(BytesRead {
                bytes: bytes.len() as u64,
                target: self.name.clone(),
            });

            let reader = self.reader.clone();
            let owned_path = path.to_string();
            let result = tokio::task::spawn_blocking(move || {
                reader.read(bytes, skip, remaining, &owned_path)
            })
            .await
            .context(ParseTaskSnafu)??;

            remaining -= result.lines_consumed - skip;
            if result.finished {
                batch.offsets.mark_finished(path);
                still_pending -= 1;
            } else {
                batch.offsets.update_lines(path, result.lines_consumed);
            }

            batch.rescued += result.rescued;
            batch.records.extend(result.records);
            batch
                .malformed
                .extend(result.malformed.into_iter().map(|m| MalformedRecord {
                    file: path.to_string(),
                    line: m.line,
                    error: m.error,
                    raw: m.raw,
                }));
        }

        batch.offsets.prune_finished();

        emit!(PendingFiles {
            count: still_pending,
            target: self.name.clone(),
        });
        if !batch.records.is_empty() {
            emit!(RecordsRead {
                count: batch.records.len() as u64,
                target: self.name.clone(),
            });
        }
        debug!(
            target = %self.name,
            records = batch.records.len(),
            malformed = batch.malformed.len(),
            "Polled source batch"
        );

        Ok(batch)
    }
}

fn is_data_file(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    if name.starts_with('.') || name.starts_with('_') {
        return false;
    }
    let name = name.strip_suffix(".gz").unwrap_or(name);
    EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}
