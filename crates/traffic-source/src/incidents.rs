//! TomTom Traffic Incident Details client.

use std::time::Duration;

use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::Value;
use traffic_types::{BoundingBox, IncidentRecord};

use crate::{build_http_client, ensure_success, ApiEndpoint, SnapshotSource, SourceError};

/// Field projection requested from the incident details endpoint.
pub const INCIDENT_FIELDS: &str = "{incidents{type,geometry{type,coordinates},properties{id,iconCategory,magnitudeOfDelay,events{description,code,iconCategory},startTime,endTime,from,to,length,delay,roadNumbers,timeValidity,probabilityOfOccurrence,numberOfReports,lastReportTime,tmc{countryCode,tableNumber,tableVersion,direction,points{location,offset}}}}}";

#[derive(Debug, Deserialize)]
struct IncidentResponse {
    #[serde(default)]
    incidents: Option<Vec<Value>>,
}

#[derive(Debug, Clone)]
pub struct TomTomIncidentClient {
    client: Client,
    endpoint: ApiEndpoint,
    api_key: String,
    language: String,
    time_validity_filter: String,
}

impl TomTomIncidentClient {
    pub fn new(
        api_key: impl Into<String>,
        endpoint: ApiEndpoint,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        Ok(Self {
            client: build_http_client(timeout)?,
            endpoint,
            api_key: api_key.into(),
            language: "en-GB".to_string(),
            time_validity_filter: "present".to_string(),
        })
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_time_validity_filter(mut self, filter: impl Into<String>) -> Self {
        self.time_validity_filter = filter.into();
        self
    }
}

impl SnapshotSource for TomTomIncidentClient {
    fn fetch_snapshot(&self, bbox: &BoundingBox) -> Result<Vec<IncidentRecord>, SourceError> {
        let bbox_param = bbox.to_string();
        let response = self
            .client
            .get(self.endpoint.url())
            .query(&[
                ("key", self.api_key.as_str()),
                ("bbox", bbox_param.as_str()),
                ("fields", INCIDENT_FIELDS),
                ("language", self.language.as_str()),
                ("timeValidityFilter", self.time_validity_filter.as_str()),
            ])
            .send()?;
        let body = ensure_success("incident details", response)?.text()?;
        let records = decode_incidents(&body)?;
        tracing::info!(incidents = records.len(), bbox = %bbox_param, "fetched incident snapshot");
        Ok(records)
    }
}

/// Decodes the `incidents` array, dropping elements that do not fit the
/// record shape instead of failing the whole snapshot.
pub fn decode_incidents(body: &str) -> Result<Vec<IncidentRecord>, SourceError> {
    let response: IncidentResponse = serde_json::from_str(body)?;
    let raw = response.incidents.unwrap_or_default();
    let mut records = Vec::with_capacity(raw.len());
    for (index, value) in raw.into_iter().enumerate() {
        match serde_json::from_value::<IncidentRecord>(value) {
            Ok(record) => records.push(record),
            Err(error) => {
                tracing::warn!(index, %error, "dropping undecodable incident element");
            }
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::{decode_incidents, TomTomIncidentClient, INCIDENT_FIELDS};
    use crate::{ApiEndpoint, SnapshotSource, SourceError};
    use httpmock::Method::GET;
    use httpmock::MockServer;
    use serde_json::json;
    use std::time::Duration;
    use traffic_types::BoundingBox;

    fn bbox() -> BoundingBox {
        "103.6,1.16,104.1,1.47".parse().expect("bbox")
    }

    fn client(server: &MockServer) -> TomTomIncidentClient {
        TomTomIncidentClient::new(
            "test-key",
            ApiEndpoint::tomtom_incidents(&server.base_url()),
            Duration::from_secs(5),
        )
        .expect("build client")
    }

    #[test]
    fn functional_fetch_snapshot_sends_projection_and_decodes_records() {
        let server = MockServer::start();
        let incidents = server.mock(|when, then| {
            when.method(GET)
                .path("/traffic/services/5/incidentDetails")
                .query_param("key", "test-key")
                .query_param("bbox", "103.6,1.16,104.1,1.47")
                .query_param("fields", INCIDENT_FIELDS)
                .query_param("language", "en-GB")
                .query_param("timeValidityFilter", "present");
            then.status(200).json_body(json!({
                "incidents": [{
                    "type": "Feature",
                    "geometry": { "type": "Point", "coordinates": [103.8, 1.35] },
                    "properties": { "id": "A", "iconCategory": 6, "delay": 120 }
                }]
            }));
        });

        let records = client(&server).fetch_snapshot(&bbox()).expect("snapshot");
        incidents.assert_calls(1);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id(), "A");
        assert_eq!(records[0].delay_or_zero(), 120.0);
    }

    #[test]
    fn regression_fetch_snapshot_reports_http_failure() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/traffic/services/5/incidentDetails");
            then.status(403).body("Developer Inactive");
        });

        let error = client(&server)
            .fetch_snapshot(&bbox())
            .expect_err("403 must fail");
        match error {
            SourceError::Status { status, body, .. } => {
                assert_eq!(status, 403);
                assert_eq!(body, "Developer Inactive");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unit_decode_tolerates_missing_array_and_bad_elements() {
        assert!(decode_incidents("{}").expect("decode").is_empty());
        assert!(decode_incidents(r#"{"incidents": null}"#)
            .expect("decode")
            .is_empty());

        let records = decode_incidents(
            r#"{"incidents": [
                {"properties": {"id": "ok"}},
                {"properties": {"id": 17, "delay": "slow"}},
                42
            ]}"#,
        )
        .expect("decode");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id(), "ok");

        assert!(matches!(
            decode_incidents("not json"),
            Err(SourceError::Json(_))
        ));
    }
}
