//! Benchmark utilities for generating change records.

use contrail::{Record, Value};
use rand::Rng;

const STATUSES: [&str; 4] = ["scheduled", "boarding", "departed", "delayed"];

/// Generate `count` flight change records over `keys` distinct flights.
///
/// Sequence values are shuffled so a share of the events arrive out of
/// order, like a real CDC feed replayed from several producers.
pub fn generate_flight_changes(count: usize, keys: usize) -> Vec<Record> {
    let mut rng = rand::rng();
    (0..count)
        .map(|i| {
            let mut record = Record::new();
            record.insert("flight_id", format!("F{:05}", i % keys.max(1)));
            record.insert("airport_id", format!("A{:03}", rng.random_range(0..200)));
            record.insert("status", STATUSES[rng.random_range(0..STATUSES.len())]);
            record.insert(
                "modifiedDate",
                Value::Int64(i as i64 + rng.random_range(-50..50)),
            );
            record
        })
        .collect()
}
