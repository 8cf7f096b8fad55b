//! NDJSON reader.
//!
//! Decompresses raw file bytes, splits them into lines and decodes each
//! non-empty line into a [`Record`]. Lines that are not JSON objects are
//! reported as malformed. With a declared schema, fields that fail type
//! coercion are moved into the `_rescued_data` side channel.

use bytes::Bytes;
use indexmap::IndexMap;
use snafu::prelude::*;
use std::io::Read;
use std::sync::Arc;
use tracing::debug;

use crate::config::CompressionFormat;
use crate::error::{DecompressSnafu, SourceError};
use crate::schema::FieldType;
use crate::value::{RESCUED_DATA_COLUMN, Record};

/// Declared source schema: column name to type.
pub type SourceSchema = Arc<IndexMap<String, FieldType>>;

/// A line that could not be decoded into a record.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedLine {
    /// 1-based physical line number in the decompressed file.
    pub line: usize,
    pub error: String,
    pub raw: String,
}

/// Result of reading part of a file.
#[derive(Debug, Default)]
pub struct ReadResult {
    pub records: Vec<Record>,
    pub malformed: Vec<MalformedLine>,
    /// Non-empty lines consumed from the start of the file, including skipped ones.
    pub lines_consumed: usize,
    /// Whether the end of the file was reached.
    pub finished: bool,
    /// Records that had at least one field rescued.
    pub rescued: usize,
}

/// Reader for newline-delimited JSON files.
#[derive(Debug, Clone)]
pub struct NdjsonReader {
    schema: Option<SourceSchema>,
    compression: CompressionFormat,
}

impl NdjsonReader {
    pub fn new(schema: Option<SourceSchema>, compression: CompressionFormat) -> Self {
        Self {
            schema,
            compression,
        }
    }

    /// Decode up to `max_lines` non-empty lines after skipping `skip_lines`.
    ///
    /// Both records and malformed lines count towards `max_lines`, so the
    /// returned `lines_consumed` is a stable resume position.
    pub fn read(
        &self,
        compressed: Bytes,
        skip_lines: usize,
        max_lines: usize,
        path: &str,
    ) -> Result<ReadResult, SourceError> {
        let data = self.decompress(compressed, path)?;
        let text = String::from_utf8_lossy(&data);

        let mut result = ReadResult::default();
        let mut seen = 0usize;
        let mut taken = 0usize;
        let mut exhausted = true;

        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            seen += 1;
            if seen <= skip_lines {
                continue;
            }
            if taken == max_lines {
                exhausted = false;
                break;
            }
            taken += 1;

            match self.decode_line(line) {
                Ok((record, rescued)) => {
                    if rescued {
                        result.rescued += 1;
                    }
                    result.records.push(record);
                }
                Err(error) => result.malformed.push(MalformedLine {
                    line: index + 1,
                    error,
                    raw: line.to_string(),
                }),
            }
        }

        result.lines_consumed = skip_lines + taken;
        result.finished = exhausted;

        debug!(
            "Decoded {} records ({} malformed) from {}",
            result.records.len(),
            result.malformed.len(),
            path
        );
        Ok(result)
    }

    fn decompress(&self, compressed: Bytes, path: &str) -> Result<Vec<u8>, SourceError> {
        let gzip = match self.compression {
            CompressionFormat::Gzip => true,
            CompressionFormat::None => false,
            CompressionFormat::Auto => path.ends_with(".gz"),
        };
        if !gzip {
            return Ok(compressed.to_vec());
        }

        let mut decoder = flate2::read::GzDecoder::new(&compressed[..]);
        let mut buf = Vec::new();
        decoder
            .read_to_end(&mut buf)
            .context(DecompressSnafu { path })?;
        Ok(buf)
    }

    /// Decode a line, returning the record and whether anything was rescued.
    fn decode_line(&self, line: &str) -> Result<(Record, bool), String> {
        let object = match serde_json::from_str::<serde_json::Value>(line) {
            Ok(serde_json::Value::Object(object)) => object,
            Ok(other) => return Err(format!("expected a JSON object, found {}", json_kind(&other))),
            Err(e) => return Err(e.to_string()),
        };

        let Some(schema) = &self.schema else {
            return Ok((Record::from_json_object(object), false));
        };

        let mut record = Record::from_json_object(object);
        let mut rescued = serde_json::Map::new();
        for (column, ty) in schema.iter() {
            let Some(value) = record.get_mut(column) else {
                continue;
            };
            if let Some(cast) = ty.cast(value) {
                *value = cast;
            } else {
                let raw = std::mem::take(value);
                rescued.insert(column.clone(), raw.to_json());
            }
        }

        let any_rescued = !rescued.is_empty();
        if any_rescued {
            record.insert(
                RESCUED_DATA_COLUMN,
                crate::value::Value::Json(serde_json::Value::Object(rescued)),
            );
        }
        Ok((record, any_rescued))
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}
