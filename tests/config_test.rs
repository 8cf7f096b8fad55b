//! The shipped sample configuration loads, forms a valid graph and runs.

mod common;

use common::{BUSINESS_COLUMNS, Lake, find, string};
use contrail::config::{ConfigPath, StageKey};
use contrail::{Config, PipelineGraph, Value};
use serde_json::json;

#[test]
fn test_sample_config_builds_graph() {
    let config = Config::from_paths(&[ConfigPath::from_arg("config/flights.yaml")]).unwrap();
    assert_eq!(config.entities.len(), 4);
    assert_eq!(config.views.len(), 1);
    assert_eq!(config.error_handling.max_failures, 1000);

    let graph = PipelineGraph::from_config(&config).unwrap();
    let order: Vec<_> = graph.stages().iter().map(|s| s.name.as_str()).collect();
    assert_eq!(order.last(), Some(&"business"));
    assert!(graph.describe().contains("silver_business [upsert by booking_id]"));

    let business = &config.views[&StageKey::new("business")];
    assert_eq!(business.dimensions.len(), 3);
}

#[test]
fn test_config_directory_is_merged() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("a.yaml"),
        "output: { path: /tmp/out }\nentities:\n  a:\n    source: { path: /tmp/raw/a }\n",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("b.yml"),
        "entities:\n  b:\n    source: { path: /tmp/raw/b }\n",
    )
    .unwrap();
    std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

    let config = Config::from_paths(&[ConfigPath::from_arg(dir.path())]).unwrap();
    let names: Vec<_> = config.entities.keys().map(StageKey::id).collect();
    assert_eq!(names, vec!["a", "b"]);
}

#[tokio::test]
async fn test_sample_config_runs_once() {
    let lake = Lake::new();
    let mut config = Config::from_file("config/flights.yaml").unwrap();
    lake.relocate(&mut config);

    // Raw change events carry no sequence of their own; ingestion stamps it.
    lake.write(
        "flights",
        "001.ndjson",
        &[
            json!({"flight_id": "F1", "airport_id": "A1", "status": "scheduled"}),
            json!({"flight_id": "F1", "airport_id": "A1", "status": "boarding"}),
        ],
    );
    lake.write(
        "passengers",
        "001.ndjson",
        &[json!({"passenger_id": "P1", "name": "Ada", "nationality": "UK"})],
    );
    lake.write(
        "airports",
        "001.ndjson",
        &[json!({"airport_id": "A1", "airport_name": "Heathrow", "city": "London", "country": "UK"})],
    );
    lake.write(
        "bookings",
        "001.ndjson",
        &[json!({"booking_id": "B1", "passenger_id": "P1", "flight_id": "F1", "amount": "250.00", "booking_date": "2024-03-01"})],
    );

    let mut topology = lake.topology(&config).await;
    assert!(topology.run_until_idle().await.unwrap() > 0);
    assert!(lake.dlq_lines().is_empty());

    let flights = topology.snapshot("silver_flights").await.unwrap();
    assert_eq!(flights.len(), 1);
    // Both events share the batch's processing time; the later one wins.
    assert_eq!(string(&flights[0], "status"), "boarding");
    assert!(matches!(flights[0].value("modifiedDate"), Value::Timestamp(_)));

    let rows = topology.snapshot("silver_business").await.unwrap();
    assert_eq!(rows.len(), 1);
    let b1 = find(&rows, "booking_id", "B1").unwrap();
    assert_eq!(
        b1.iter().map(|(c, _)| c.as_str()).collect::<Vec<_>>(),
        BUSINESS_COLUMNS.to_vec()
    );
    assert_eq!(b1.value("amount"), &Value::Float64(250.0));
    assert_eq!(string(b1, "city"), "London");
    assert_eq!(string(b1, "country"), "UK");
}
