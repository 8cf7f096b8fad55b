//! Per-file read progress for a raw-zone source.
//!
//! Tracks which files have been fully read and how many lines of the
//! file currently being read were consumed, so a restarted source resumes
//! exactly where its last committed batch ended.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Read state of a single file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FileReadState {
    /// File has been completely read.
    Finished,
    /// File is partially read; this many non-empty lines were consumed.
    LinesRead(usize),
}

/// Progress through every file of a source.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceOffsets {
    /// File path to read state. After pruning only in-progress files remain.
    pub files: BTreeMap<String, FileReadState>,
    /// All files sorting at or before this path are finished.
    #[serde(default)]
    pub high_water_mark: Option<String>,
}

impl SourceOffsets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_finished(&mut self, path: &str) {
        self.files.insert(path.to_string(), FileReadState::Finished);
    }

    pub fn update_lines(&mut self, path: &str, lines_read: usize) {
        self.files
            .insert(path.to_string(), FileReadState::LinesRead(lines_read));
    }

    /// A file is finished if it is explicitly marked so or sorts at or
    /// before the high-water mark.
    pub fn is_finished(&self, path: &str) -> bool {
        if matches!(self.files.get(path), Some(FileReadState::Finished)) {
            return true;
        }
        match &self.high_water_mark {
            Some(last) => path <= last.as_str(),
            None => false,
        }
    }

    /// Fold finished entries into the high-water mark.
    ///
    /// Only `LinesRead` entries survive, which keeps the offsets bounded no
    /// matter how many files the location accumulates.
    pub fn prune_finished(&mut self) {
        let max_finished = self
            .files
            .iter()
            .filter(|(_, state)| matches!(state, FileReadState::Finished))
            .map(|(path, _)| path.as_str())
            .max();

        if let Some(max) = max_finished {
            let advance = match &self.high_water_mark {
                Some(current) => max > current.as_str(),
                None => true,
            };
            if advance {
                self.high_water_mark = Some(max.to_string());
            }
        }

        self.files
            .retain(|_, state| matches!(state, FileReadState::LinesRead(_)));
    }

    /// Number of non-empty lines already consumed from `path`.
    pub fn lines_to_skip(&self, path: &str) -> usize {
        match self.files.get(path) {
            Some(FileReadState::LinesRead(n)) => *n,
            _ => 0,
        }
    }

    /// Files from `all_files` that still need reading, in input order.
    pub fn pending<'a>(&self, all_files: &'a [String]) -> Vec<&'a str> {
        all_files
            .iter()
            .filter(|f| !self.is_finished(f))
            .map(String::as_str)
            .collect()
    }
}
