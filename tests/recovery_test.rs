//! Restarting a pipeline resumes from committed progress.

mod common;

use common::{Lake, airport, booking, find, flight, passenger, string};
use contrail::Value;
use serde_json::json;

#[tokio::test]
async fn test_restart_does_not_reprocess() {
    let lake = Lake::new();
    lake.write(
        "bookings",
        "001.ndjson",
        &[booking("B1", "P1", "F1"), booking("B2", "P1", "F1")],
    );
    lake.write("flights", "001.ndjson", &[flight("F1", "A1", 1)]);
    lake.write("passengers", "001.ndjson", &[passenger("P1", 1)]);
    lake.write("airports", "001.ndjson", &[airport("A1", "Heathrow", 1)]);
    let config = lake.config();

    {
        let mut topology = lake.topology(&config).await;
        assert!(topology.run_until_idle().await.unwrap() > 0);
    }

    let mut restarted = lake.topology(&config).await;
    assert_eq!(restarted.run_until_idle().await.unwrap(), 0);
    assert_eq!(restarted.snapshot("silver_bookings").await.unwrap().len(), 2);
    assert_eq!(restarted.snapshot("business_view").await.unwrap().len(), 2);

    lake.write("bookings", "002.ndjson", &[booking("B3", "P1", "F1")]);
    restarted.run_until_idle().await.unwrap();
    assert_eq!(restarted.snapshot("silver_bookings").await.unwrap().len(), 3);
    assert_eq!(restarted.snapshot("business_view").await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_line_offsets_commit_per_batch() {
    let lake = Lake::new();
    lake.write(
        "bookings",
        "001.ndjson",
        &[
            booking("B1", "P1", "F1"),
            booking("B2", "P1", "F1"),
            booking("B3", "P1", "F1"),
        ],
    );
    let mut config = lake.config();
    for entity in config.entities.values_mut() {
        entity.source.batch_size = 1;
    }
    {
        let mut topology = lake.topology(&config).await;
        // Three single-line commits. The view catches up while it restores.
        assert_eq!(topology.run_until_idle().await.unwrap(), 3);
    }

    lake.write("bookings", "002.ndjson", &[booking("B4", "P1", "F1")]);
    let mut restarted = lake.topology(&config).await;
    restarted.run_until_idle().await.unwrap();
    let rows = restarted.snapshot("silver_bookings").await.unwrap();
    let mut ids: Vec<_> = rows.iter().map(|r| string(r, "booking_id")).collect();
    ids.sort();
    assert_eq!(ids, vec!["B1", "B2", "B3", "B4"]);
}

#[tokio::test]
async fn test_cdc_state_survives_restart() {
    let lake = Lake::new();
    lake.write(
        "flights",
        "001.ndjson",
        &[json!({"flight_id": "F1", "airport_id": "A1", "status": "boarding", "modifiedDate": 5})],
    );
    let config = lake.config();
    {
        let mut topology = lake.topology(&config).await;
        topology.run_until_idle().await.unwrap();
    }

    lake.write(
        "flights",
        "002.ndjson",
        &[json!({"flight_id": "F1", "airport_id": "A1", "status": "stale", "modifiedDate": 4})],
    );
    let mut restarted = lake.topology(&config).await;
    restarted.run_until_idle().await.unwrap();
    let rows = restarted.snapshot("silver_flights").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(string(find(&rows, "flight_id", "F1").unwrap(), "status"), "boarding");
}

#[tokio::test]
async fn test_held_facts_survive_restart() {
    let lake = Lake::new();
    lake.write("bookings", "001.ndjson", &[booking("B1", "P1", "F1")]);
    lake.write("passengers", "001.ndjson", &[passenger("P1", 1)]);
    lake.write("airports", "001.ndjson", &[airport("A1", "Heathrow", 1)]);
    let config = lake.config();
    {
        let mut topology = lake.topology(&config).await;
        topology.run_until_idle().await.unwrap();
        assert!(topology.snapshot("business_view").await.unwrap().is_empty());
    }

    lake.write("flights", "001.ndjson", &[flight("F1", "A1", 1)]);
    let mut restarted = lake.topology(&config).await;
    restarted.run_until_idle().await.unwrap();
    let rows = restarted.snapshot("business_view").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(string(&rows[0], "airport_name"), "Heathrow");
}

#[tokio::test]
async fn test_drop_policy_keeps_retracted_facts_across_restart() {
    let lake = Lake::new();
    lake.write("bookings", "001.ndjson", &[booking("B1", "P1", "F1")]);
    lake.write("flights", "001.ndjson", &[flight("F1", "A1", 1)]);
    lake.write("passengers", "001.ndjson", &[passenger("P1", 1)]);
    lake.write("airports", "001.ndjson", &[airport("A1", "Heathrow", 1)]);
    let config = lake.config_with("drop");
    {
        let mut topology = lake.topology(&config).await;
        topology.run_until_idle().await.unwrap();
        assert_eq!(topology.snapshot("business_view").await.unwrap().len(), 1);

        // The flight moves to an airport that does not exist yet.
        lake.write("flights", "002.ndjson", &[flight("F1", "A2", 2)]);
        topology.run_until_idle().await.unwrap();
        assert!(topology.snapshot("business_view").await.unwrap().is_empty());
    }

    lake.write("airports", "002.ndjson", &[airport("A2", "Gatwick", 1)]);
    let mut restarted = lake.topology(&config).await;
    restarted.run_until_idle().await.unwrap();
    let rows = restarted.snapshot("business_view").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(string(&rows[0], "airport_name"), "Gatwick");
    assert_eq!(rows[0].value("airport_id"), &Value::from("A2"));
}

#[tokio::test]
async fn test_restart_recovers_from_snapshots() {
    let lake = Lake::new();
    let mut config = lake.config();
    config.output.snapshot_interval = Some(2);
    for entity in config.entities.values_mut() {
        entity.source.batch_size = 1;
    }
    lake.write("flights", "001.ndjson", &[flight("F1", "A1", 1)]);
    lake.write("passengers", "001.ndjson", &[passenger("P1", 1)]);
    lake.write("airports", "001.ndjson", &[airport("A1", "Heathrow", 1)]);
    lake.write(
        "bookings",
        "001.ndjson",
        &[
            booking("B1", "P1", "F1"),
            booking("B2", "P1", "F1"),
            booking("B3", "P1", "F1"),
        ],
    );
    {
        let mut topology = lake.topology(&config).await;
        topology.run_until_idle().await.unwrap();
    }
    assert!(lake.path("silver/silver_bookings/_snapshot").is_dir());

    lake.write("bookings", "002.ndjson", &[booking("B4", "P1", "F1")]);
    let mut restarted = lake.topology(&config).await;
    restarted.run_until_idle().await.unwrap();
    assert_eq!(restarted.snapshot("silver_bookings").await.unwrap().len(), 4);
    let rows = restarted.snapshot("business_view").await.unwrap();
    let mut ids: Vec<_> = rows.iter().map(|r| string(r, "booking_id")).collect();
    ids.sort();
    assert_eq!(ids, vec!["B1", "B2", "B3", "B4"]);
}
