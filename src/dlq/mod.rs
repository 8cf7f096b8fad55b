//! Dead Letter Queue for records that cannot enter a conformed table.
//!
//! Malformed raw lines and change events without a usable key or sequence
//! value are written as NDJSON to a configurable storage location for
//! later inspection. Replaying them is out of scope.
//!
//! # Components
//!
//! - [`DeadLetterQueue`] - Buffers failures and writes them to storage
//! - [`FailureTracker`] - Per-stage tracker with max_failures enforcement

mod queue;
mod tracker;
mod types;

pub use queue::DeadLetterQueue;
pub use tracker::FailureTracker;
pub use types::{FailedRecord, FailureStats};
