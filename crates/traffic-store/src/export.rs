//! GeoJSON export of incidents active in a time window.

use std::io::Write;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use traffic_types::PersistedIncident;

use crate::{IncidentStore, IncidentWindow, StoreResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportSummary {
    pub exported: usize,
    /// Rows left out because their stored geometry or timestamps were unreadable.
    pub skipped: usize,
}

/// Writes every incident whose start or end falls in `[start, end]` to
/// `sink` as a GeoJSON `FeatureCollection`.
pub fn export_geojson<S, W>(
    store: &S,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    mut sink: W,
) -> StoreResult<ExportSummary>
where
    S: IncidentStore + ?Sized,
    W: Write,
{
    let window = store.incidents_in_window(start, end)?;
    for corrupt in &window.corrupt {
        tracing::warn!(
            incident_id = %corrupt.id,
            reason = %corrupt.reason,
            "skipping incident with malformed stored data in export"
        );
    }

    let collection = feature_collection(&window);
    serde_json::to_writer_pretty(&mut sink, &collection)?;
    sink.write_all(b"\n")?;
    sink.flush()?;

    let summary = ExportSummary {
        exported: window.incidents.len(),
        skipped: window.corrupt.len(),
    };
    tracing::info!(
        exported = summary.exported,
        skipped = summary.skipped,
        start = %start,
        end = %end,
        "exported incidents as geojson"
    );
    Ok(summary)
}

pub fn feature_collection(window: &IncidentWindow) -> Value {
    json!({
        "type": "FeatureCollection",
        "features": window.incidents.iter().map(feature).collect::<Vec<_>>(),
    })
}

fn feature(row: &PersistedIncident) -> Value {
    let incident = &row.incident;
    let tmc = incident.tmc.clone().unwrap_or_default();
    json!({
        "type": "Feature",
        "geometry": incident.geometry,
        "properties": {
            "id": incident.id,
            "category": incident.category,
            "magnitudeOfDelay": incident.magnitude_of_delay,
            "startTime": format_time(incident.start_time),
            "endTime": incident.end_time.map(format_time),
            "from_location": incident.from_location,
            "to_location": incident.to_location,
            "length": incident.length,
            "delay": incident.delay,
            "roadNumbers": incident.road_numbers.join(","),
            "timeValidity": incident.time_validity,
            "probabilityOfOccurrence": incident.probability_of_occurrence,
            "numberOfReports": incident.number_of_reports,
            "lastReportTime": incident.last_report_time,
            "countryCode": tmc.country_code,
            "tableNumber": tmc.table_number,
            "tableVersion": tmc.table_version,
            "direction": tmc.direction,
            "lastSeen": row.last_seen.map(format_time),
            "events": incident.events,
        }
    })
}

fn format_time(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::export_geojson;
    use crate::{IncidentStore, InMemoryIncidentStore, SqliteIncidentStore};
    use chrono::{DateTime, TimeDelta, TimeZone, Utc};
    use serde_json::{json, Value};
    use traffic_types::IncidentRecord;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + TimeDelta::seconds(seconds)
    }

    fn record(id: &str, geometry: Value) -> IncidentRecord {
        serde_json::from_value(json!({
            "type": "Feature",
            "geometry": geometry,
            "properties": {
                "id": id,
                "iconCategory": 6,
                "delay": 95.0,
                "startTime": "2024-01-01T00:00:00Z",
                "roadNumbers": ["CTE"],
                "tmc": { "countryCode": 3, "direction": "-" }
            }
        }))
        .expect("decode record")
    }

    #[test]
    fn functional_export_writes_feature_collection() {
        let mut store = InMemoryIncidentStore::new();
        store.upsert_at(
            &record("A", json!({ "type": "Point", "coordinates": [103.8, 1.35] })),
            at(30),
        );

        let mut buffer = Vec::new();
        let summary = export_geojson(&store, at(0), at(60), &mut buffer).expect("export");
        assert_eq!((summary.exported, summary.skipped), (1, 0));

        let document: Value = serde_json::from_slice(&buffer).expect("valid json");
        assert_eq!(document["type"], "FeatureCollection");
        let feature = &document["features"][0];
        assert_eq!(feature["geometry"]["type"], "Point");
        assert_eq!(feature["geometry"]["coordinates"], json!([103.8, 1.35]));
        assert_eq!(feature["properties"]["id"], "A");
        assert_eq!(feature["properties"]["startTime"], "2024-01-01T00:00:00Z");
        assert_eq!(feature["properties"]["endTime"], Value::Null);
        assert_eq!(feature["properties"]["lastSeen"], "2024-01-01T00:00:30Z");
        assert_eq!(feature["properties"]["roadNumbers"], "CTE");
        assert_eq!(feature["properties"]["countryCode"], "3");
    }

    #[test]
    fn regression_export_skips_rows_with_malformed_geometry() {
        let mut store = SqliteIncidentStore::open_in_memory().expect("open store");
        let line = json!({ "type": "LineString", "coordinates": [[103.8, 1.35], [103.9, 1.36]] });
        store.upsert_at(&record("A", line.clone()), at(0));
        store.upsert_at(&record("B", line), at(0));
        store
            .connection()
            .execute(
                "UPDATE incidents SET coordinates = '[[103.8, 1.35]]' WHERE id = 'B'",
                [],
            )
            .expect("corrupt geometry");

        let mut buffer = Vec::new();
        let summary = export_geojson(&store, at(0), at(60), &mut buffer).expect("export");
        assert_eq!((summary.exported, summary.skipped), (1, 1));

        let document: Value = serde_json::from_slice(&buffer).expect("valid json");
        let features = document["features"].as_array().expect("features array");
        assert_eq!(features.len(), 1);
        assert_eq!(features[0]["properties"]["id"], "A");
    }

    #[test]
    fn unit_export_of_empty_window_is_an_empty_collection() {
        let store = InMemoryIncidentStore::new();
        let mut buffer = Vec::new();
        let summary = export_geojson(&store, at(0), at(60), &mut buffer).expect("export");
        assert_eq!(summary.exported, 0);
        let document: Value = serde_json::from_slice(&buffer).expect("valid json");
        assert_eq!(document["features"], json!([]));
    }
}
