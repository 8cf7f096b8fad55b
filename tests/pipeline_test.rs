//! End-to-end runs over a temporary lake.

mod common;

use common::{BUSINESS_COLUMNS, Lake, airport, booking, find, flight, passenger, string};
use contrail::Value;
use serde_json::json;

#[tokio::test]
async fn test_bookings_validation_drops_invalid_records() {
    let lake = Lake::new();
    lake.write(
        "bookings",
        "001.ndjson",
        &[
            json!({"booking_id": "B1", "passenger_id": "P1", "flight_id": "F1", "amount": "120.50", "booking_date": "2024-01-05"}),
            json!({"booking_id": "B2", "passenger_id": null, "flight_id": "F1", "amount": 80}),
            json!({"passenger_id": "P3", "flight_id": "F1", "amount": 10}),
        ],
    );
    lake.write_gz(
        "bookings",
        "002.ndjson.gz",
        &[json!({"booking_id": "B4", "passenger_id": "P4", "flight_id": "F2", "amount": "oops"})],
    );

    let config = lake.config();
    let mut topology = lake.topology(&config).await;
    topology.run_until_idle().await.unwrap();

    let rows = topology.snapshot("silver_bookings").await.unwrap();
    assert_eq!(rows.len(), 2);
    let b1 = find(&rows, "booking_id", "B1").unwrap();
    assert_eq!(b1.value("amount"), &Value::Float64(120.5));
    assert!(matches!(b1.value("booking_date"), Value::Date(_)));
    assert!(matches!(b1.value("modifiedDate"), Value::Timestamp(_)));

    // A failed cast yields NULL instead of dropping the record.
    let b4 = find(&rows, "booking_id", "B4").unwrap();
    assert!(b4.value("amount").is_null());

    // Rule violations are dropped, not failed.
    assert!(lake.dlq_lines().is_empty());
}

#[tokio::test]
async fn test_malformed_lines_go_to_dlq() {
    let lake = Lake::new();
    lake.write_raw(
        "bookings",
        "001.ndjson",
        "{\"booking_id\":\"B1\",\"passenger_id\":\"P1\"}\n{broken\n",
    );

    let config = lake.config();
    let mut topology = lake.topology(&config).await;
    topology.run_until_idle().await.unwrap();

    assert_eq!(topology.snapshot("silver_bookings").await.unwrap().len(), 1);
    let failures = lake.dlq_lines();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0]["target"], "bookings");
    assert_eq!(failures[0]["line"], 2);
    assert_eq!(failures[0]["record"], "{broken");
}

#[tokio::test]
async fn test_cdc_keeps_latest_sequence_across_batches() {
    let lake = Lake::new();
    lake.write(
        "flights",
        "001.ndjson",
        &[
            json!({"flight_id": "F1", "airport_id": "A1", "status": "scheduled", "modifiedDate": 1}),
            json!({"flight_id": "F1", "airport_id": "A1", "status": "boarding", "modifiedDate": 3}),
            json!({"flight_id": "F1", "airport_id": "A1", "status": "delayed", "modifiedDate": 2}),
            json!({"flight_id": "F2", "airport_id": "A2", "status": "first", "modifiedDate": 5}),
            json!({"flight_id": "F2", "airport_id": "A2", "status": "second", "modifiedDate": 5}),
        ],
    );

    let config = lake.config();
    let mut topology = lake.topology(&config).await;
    topology.run_until_idle().await.unwrap();

    let rows = topology.snapshot("silver_flights").await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(string(find(&rows, "flight_id", "F1").unwrap(), "status"), "boarding");
    // Equal sequence: the later arrival wins.
    assert_eq!(string(find(&rows, "flight_id", "F2").unwrap(), "status"), "second");

    // A late, older event never overwrites newer state.
    lake.write(
        "flights",
        "002.ndjson",
        &[json!({"flight_id": "F1", "airport_id": "A1", "status": "late", "modifiedDate": 2})],
    );
    topology.run_until_idle().await.unwrap();
    let rows = topology.snapshot("silver_flights").await.unwrap();
    assert_eq!(string(find(&rows, "flight_id", "F1").unwrap(), "status"), "boarding");

    lake.write(
        "flights",
        "003.ndjson",
        &[json!({"flight_id": "F1", "airport_id": "A1", "status": "departed", "modifiedDate": 4})],
    );
    topology.run_until_idle().await.unwrap();
    let rows = topology.snapshot("silver_flights").await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(string(find(&rows, "flight_id", "F1").unwrap(), "status"), "departed");
}

#[tokio::test]
async fn test_cdc_null_key_is_rejected_to_dlq() {
    let lake = Lake::new();
    lake.write(
        "airports",
        "001.ndjson",
        &[
            json!({"airport_id": null, "airport_name": "Nowhere", "modifiedDate": 1}),
            json!({"airport_id": "A1", "airport_name": "Heathrow", "modifiedDate": 1}),
        ],
    );

    let config = lake.config();
    let mut topology = lake.topology(&config).await;
    topology.run_until_idle().await.unwrap();

    assert_eq!(topology.snapshot("silver_airports").await.unwrap().len(), 1);
    let failures = lake.dlq_lines();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0]["target"], "airports");
    assert_eq!(failures[0]["record"]["airport_name"], "Nowhere");
}

#[tokio::test]
async fn test_business_view_is_complete_and_follows_dimensions() {
    let lake = Lake::new();
    lake.write(
        "bookings",
        "001.ndjson",
        &[booking("B1", "P1", "F1"), booking("B2", "P2", "F9")],
    );
    lake.write("flights", "001.ndjson", &[flight("F1", "A1", 1)]);
    lake.write("passengers", "001.ndjson", &[passenger("P1", 1), passenger("P2", 1)]);
    lake.write("airports", "001.ndjson", &[airport("A1", "Heathrow", 1)]);

    let config = lake.config();
    let mut topology = lake.topology(&config).await;
    topology.run_until_idle().await.unwrap();

    // B2 has no flight yet, so only B1 is visible.
    let rows = topology.snapshot("business_view").await.unwrap();
    assert_eq!(rows.len(), 1);
    let b1 = find(&rows, "booking_id", "B1").unwrap();
    assert_eq!(
        b1.iter().map(|(c, _)| c.as_str()).collect::<Vec<_>>(),
        BUSINESS_COLUMNS.to_vec()
    );
    assert_eq!(string(b1, "airport_name"), "Heathrow");
    assert_eq!(string(b1, "city"), "London");
    assert_eq!(string(b1, "country"), "UK");
    assert_eq!(b1.value("amount"), &Value::Float64(100.0));
    assert!(matches!(b1.value("booking_date"), Value::Date(_)));

    // The held booking is emitted once its flight arrives.
    lake.write("flights", "002.ndjson", &[flight("F9", "A1", 1)]);
    topology.run_until_idle().await.unwrap();
    assert_eq!(topology.snapshot("business_view").await.unwrap().len(), 2);

    // A booking waits for its passenger as well.
    lake.write("bookings", "002.ndjson", &[booking("B3", "P3", "F1")]);
    topology.run_until_idle().await.unwrap();
    assert_eq!(topology.snapshot("business_view").await.unwrap().len(), 2);
    lake.write("passengers", "002.ndjson", &[passenger("P3", 1)]);
    topology.run_until_idle().await.unwrap();
    let rows = topology.snapshot("business_view").await.unwrap();
    assert_eq!(rows.len(), 3);
    assert!(find(&rows, "booking_id", "B3").is_some());

    // A dimension update re-emits every row that uses it.
    lake.write("airports", "002.ndjson", &[airport("A1", "London Heathrow", 2)]);
    topology.run_until_idle().await.unwrap();
    let rows = topology.snapshot("business_view").await.unwrap();
    assert_eq!(rows.len(), 3);
    for row in &rows {
        assert_eq!(string(row, "airport_name"), "London Heathrow");
    }

    // Re-pointing a flight to an unknown airport retracts its bookings.
    lake.write("flights", "003.ndjson", &[flight("F9", "A404", 2)]);
    topology.run_until_idle().await.unwrap();
    let rows = topology.snapshot("business_view").await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(find(&rows, "booking_id", "B2").is_none());
}

#[tokio::test]
async fn test_drop_policy_discards_unjoinable_facts() {
    let lake = Lake::new();
    lake.write("bookings", "001.ndjson", &[booking("B1", "P1", "F1")]);

    let config = lake.config_with("drop");
    let mut topology = lake.topology(&config).await;
    topology.run_until_idle().await.unwrap();
    assert!(topology.snapshot("business_view").await.unwrap().is_empty());

    lake.write("flights", "001.ndjson", &[flight("F1", "A1", 1)]);
    lake.write("passengers", "001.ndjson", &[passenger("P1", 1)]);
    lake.write("airports", "001.ndjson", &[airport("A1", "Heathrow", 1)]);
    topology.run_until_idle().await.unwrap();
    assert!(topology.snapshot("business_view").await.unwrap().is_empty());

    // A booking that joins on arrival is kept.
    lake.write("bookings", "002.ndjson", &[booking("B2", "P1", "F1")]);
    topology.run_until_idle().await.unwrap();
    let rows = topology.snapshot("business_view").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert!(find(&rows, "booking_id", "B2").is_some());
}

#[tokio::test]
async fn test_unknown_snapshot_table() {
    let lake = Lake::new();
    let config = lake.config();
    let topology = lake.topology(&config).await;
    assert!(topology.snapshot("silver_nothing").await.is_err());
    assert_eq!(topology.stages().count(), 5);
}
