use std::time::Duration;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use httpmock::Method::GET;
use httpmock::MockServer;
use serde_json::{json, Value};
use tempfile::tempdir;
use traffic_report::{CsvReport, CycleStats, SummaryWindow, WindowSummary};
use traffic_source::{ApiEndpoint, SnapshotSource, TomTomIncidentClient};
use traffic_store::{export_geojson, IncidentStore, SqliteIncidentStore};
use traffic_types::{BoundingBox, CauseMapping};

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + TimeDelta::seconds(seconds)
}

fn bbox() -> BoundingBox {
    "103.6,1.16,104.1,1.47".parse().expect("bbox")
}

fn incident(id: &str, category: i64, delay: Option<f64>) -> Value {
    json!({
        "type": "Feature",
        "geometry": {
            "type": "LineString",
            "coordinates": [[103.81, 1.30], [103.82, 1.31]]
        },
        "properties": {
            "id": id,
            "iconCategory": category,
            "magnitudeOfDelay": 2,
            "delay": delay,
            "startTime": "2024-01-01T00:00:00Z",
            "endTime": null,
            "roadNumbers": ["PIE"],
            "events": [{ "description": "Stationary traffic", "code": 101, "iconCategory": category }]
        }
    })
}

fn client(server: &MockServer) -> TomTomIncidentClient {
    TomTomIncidentClient::new(
        "integration-key",
        ApiEndpoint::tomtom_incidents(&server.base_url()),
        Duration::from_secs(5),
    )
    .expect("build client")
}

#[test]
fn integration_snapshot_disappearance_ends_incident_and_exports_it() {
    let temp = tempdir().expect("tempdir");
    let server = MockServer::start();
    let mapping = CauseMapping::default();
    let mut store =
        SqliteIncidentStore::open(temp.path().join("TrafficIncidents.db")).expect("open store");
    let report = CsvReport::open(temp.path(), &mapping).expect("open report");
    let source = client(&server);
    let threshold = Duration::from_secs(40);

    let mut first = server.mock(|when, then| {
        when.method(GET).path("/traffic/services/5/incidentDetails");
        then.status(200)
            .json_body(json!({ "incidents": [incident("A", 6, Some(2.0))] }));
    });
    let records = source.fetch_snapshot(&bbox()).expect("first snapshot");
    let totals = store.update_incidents_at(&records, at(0));
    assert_eq!((totals.changed, totals.inserted), (1, 1));
    store.expire_stale_at(threshold, at(0)).expect("sweep");
    report
        .append(&at(0), &CycleStats::from_snapshot(&records, &mapping), 1, 1)
        .expect("append report");
    first.assert_calls(1);
    first.delete();

    server.mock(|when, then| {
        when.method(GET).path("/traffic/services/5/incidentDetails");
        then.status(200).json_body(json!({ "incidents": [] }));
    });
    let records = source.fetch_snapshot(&bbox()).expect("second snapshot");
    let totals = store.update_incidents_at(&records, at(45));
    assert_eq!((totals.changed, totals.inserted), (0, 0));
    let row = store.get_incident("A").expect("read").expect("row");
    assert_eq!(row.last_seen, Some(at(0)));
    assert_eq!(row.incident.end_time, None);

    let sweep = store.expire_stale_at(threshold, at(45)).expect("sweep");
    assert_eq!(sweep.expired.len(), 1);
    let row = store.get_incident("A").expect("read").expect("row");
    let end_time = row.incident.end_time.expect("ended");
    assert!(end_time >= at(40));
    assert!(Some(end_time) >= row.last_seen);

    let mut buffer = Vec::new();
    let summary = export_geojson(&store, at(0), at(3_600), &mut buffer).expect("export");
    assert_eq!(summary.exported, 1);
    let document: Value = serde_json::from_slice(&buffer).expect("geojson");
    assert_eq!(document["features"][0]["properties"]["endTime"], "2024-01-01T00:00:40Z");
    assert_eq!(document["features"][0]["geometry"]["type"], "LineString");

    let window = store.incidents_in_window(at(0), at(3_600)).expect("window");
    let hourly = WindowSummary::build(
        &window.incidents,
        &mapping,
        SummaryWindow::new(at(0), at(3_600)).expect("summary window"),
        at(3_600),
    );
    assert_eq!(hourly.intervals.len(), 1);
    assert_eq!(hourly.intervals[0].mean_duration_minutes, 40.0 / 60.0);

    store.close().expect("close store");
}

#[test]
fn integration_failed_fetch_never_touches_the_store() {
    let temp = tempdir().expect("tempdir");
    let server = MockServer::start();
    let db_path = temp.path().join("TrafficIncidents.db");
    let mut store = SqliteIncidentStore::open(&db_path).expect("open store");
    let source = client(&server);

    let mut seed = server.mock(|when, then| {
        when.method(GET).path("/traffic/services/5/incidentDetails");
        then.status(200).json_body(json!({
            "incidents": [incident("A", 8, Some(30.0)), incident("B", 1, None)]
        }));
    });
    let records = source.fetch_snapshot(&bbox()).expect("seed snapshot");
    store.update_incidents_at(&records, at(0));
    seed.delete();
    let before = store
        .incidents_in_window(at(0), at(60))
        .expect("window before");

    server.mock(|when, then| {
        when.method(GET).path("/traffic/services/5/incidentDetails");
        then.status(429).body("Too Many Requests");
    });
    assert!(source.fetch_snapshot(&bbox()).is_err());

    let after = store.incidents_in_window(at(0), at(60)).expect("window after");
    assert_eq!(before, after);
    assert_eq!(store.incident_count().expect("count"), 2);
}

#[test]
fn integration_monotonic_delay_survives_regressing_feed() {
    let temp = tempdir().expect("tempdir");
    let mut store =
        SqliteIncidentStore::open(temp.path().join("TrafficIncidents.db")).expect("open store");
    let snapshots = [Some(3.0), Some(1.0), None, Some(7.0)];
    let mut changes = Vec::new();
    for (index, delay) in snapshots.into_iter().enumerate() {
        let record = serde_json::from_value(incident("A", 6, delay)).expect("record");
        let totals = store.update_incidents_at(&[record], at(index as i64 * 300));
        changes.push(totals.changed);
    }
    assert_eq!(changes, vec![1, 0, 0, 1]);

    let row = store.get_incident("A").expect("read").expect("row");
    assert_eq!(row.incident.delay, Some(7.0));
    assert_eq!(row.last_seen, Some(at(900)));
}
