//! Shared fixtures: a temporary lake with raw-zone folders and a config
//! pointing at it.

#![allow(dead_code)]

use std::io::Write;
use std::path::PathBuf;

use contrail::{Config, Record, Topology, Value};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde_json::{Value as Json, json};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub struct Lake {
    dir: TempDir,
}

impl Lake {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn path(&self, sub: &str) -> PathBuf {
        self.dir.path().join(sub)
    }

    fn raw_dir(&self, entity: &str) -> PathBuf {
        let dir = self.path("raw").join(entity);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn ndjson(lines: &[Json]) -> String {
        lines.iter().map(|l| format!("{l}\n")).collect()
    }

    /// Drop a new raw file for `entity`.
    pub fn write(&self, entity: &str, file: &str, lines: &[Json]) {
        std::fs::write(self.raw_dir(entity).join(file), Self::ndjson(lines)).unwrap();
    }

    pub fn write_raw(&self, entity: &str, file: &str, content: &str) {
        std::fs::write(self.raw_dir(entity).join(file), content).unwrap();
    }

    pub fn write_gz(&self, entity: &str, file: &str, lines: &[Json]) {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(Self::ndjson(lines).as_bytes()).unwrap();
        std::fs::write(self.raw_dir(entity).join(file), encoder.finish().unwrap()).unwrap();
    }

    /// The four-entity flights configuration with a business view.
    pub fn config(&self) -> Config {
        self.config_with("hold")
    }

    pub fn config_with(&self, join_miss: &str) -> Config {
        for entity in ["bookings", "flights", "airports", "passengers"] {
            self.raw_dir(entity);
        }
        let raw = self.path("raw");
        let yaml = format!(
            r#"
output:
  path: "{out}"
global:
  poll_jitter_secs: 0
  parallelism: 2
metrics:
  enabled: false
error_handling:
  dlq_path: "{dlq}"

entities:
  bookings:
    source:
      path: "{raw}/bookings"
    casts:
      amount: double
      booking_date: date
    processing_time_column: modifiedDate
    rules:
      rule_1: booking_id IS NOT NULL
      rule_2: passenger_id IS NOT NULL
  flights:
    source:
      path: "{raw}/flights"
    merge:
      mode: cdc
      keys: [flight_id]
      sequence_by: modifiedDate
  airports:
    source:
      path: "{raw}/airports"
    merge:
      mode: cdc
      keys: [airport_id]
      sequence_by: modifiedDate
  passengers:
    source:
      path: "{raw}/passengers"
    merge:
      mode: cdc
      keys: [passenger_id]
      sequence_by: modifiedDate

views:
  business:
    table: business_view
    fact:
      table: silver_bookings
      key: [booking_id]
    dimensions:
      - table: silver_flights
        on: flight_id
      - table: silver_passengers
        on: passenger_id
      - table: silver_airports
        on: airport_id
    select:
      - booking_id
      - passenger_id
      - flight_id
      - amount
      - booking_date
      - airport_id
      - airport_name
      - city
      - country
    join_miss: {join_miss}
"#,
            out = self.path("silver").display(),
            dlq = self.path("dlq").display(),
            raw = raw.display(),
        );
        Config::from_yaml(&yaml).unwrap()
    }

    /// Point a loaded configuration at this lake.
    pub fn relocate(&self, config: &mut Config) {
        config.output.path = self.path("silver").display().to_string();
        config.error_handling.dlq_path = Some(self.path("dlq").display().to_string());
        config.metrics.enabled = false;
        config.global.poll_jitter_secs = Some(0);
        for (key, entity) in config.entities.iter_mut() {
            entity.source.path = self.raw_dir(key.id()).display().to_string();
        }
    }

    pub async fn topology(&self, config: &Config) -> Topology {
        Topology::build(config, CancellationToken::new()).await.unwrap()
    }

    /// Lines written to the DLQ so far.
    pub fn dlq_lines(&self) -> Vec<Json> {
        let Ok(entries) = std::fs::read_dir(self.path("dlq")) else {
            return Vec::new();
        };
        let mut lines = Vec::new();
        for entry in entries {
            let content = std::fs::read_to_string(entry.unwrap().path()).unwrap();
            for line in content.lines() {
                lines.push(serde_json::from_str(line).unwrap());
            }
        }
        lines
    }
}

/// The nine columns of a business view row, in order.
pub const BUSINESS_COLUMNS: [&str; 9] = [
    "booking_id",
    "passenger_id",
    "flight_id",
    "amount",
    "booking_date",
    "airport_id",
    "airport_name",
    "city",
    "country",
];

pub fn booking(id: &str, passenger: &str, flight: &str) -> Json {
    json!({
        "booking_id": id,
        "passenger_id": passenger,
        "flight_id": flight,
        "amount": 100,
        "booking_date": "2024-01-05",
    })
}

pub fn flight(id: &str, airport: &str, sequence: i64) -> Json {
    json!({"flight_id": id, "airport_id": airport, "modifiedDate": sequence})
}

pub fn passenger(id: &str, sequence: i64) -> Json {
    json!({"passenger_id": id, "name": "Ada", "modifiedDate": sequence})
}

pub fn airport(id: &str, name: &str, sequence: i64) -> Json {
    json!({
        "airport_id": id,
        "airport_name": name,
        "city": "London",
        "country": "UK",
        "modifiedDate": sequence,
    })
}

/// Find the row whose `column` equals `value`.
pub fn find<'a>(rows: &'a [Record], column: &str, value: &str) -> Option<&'a Record> {
    rows.iter().find(|r| r.value(column) == &Value::from(value))
}

pub fn string(row: &Record, column: &str) -> String {
    match row.value(column) {
        Value::String(s) => s.clone(),
        other => panic!("{column} is not a string: {other:?}"),
    }
}
