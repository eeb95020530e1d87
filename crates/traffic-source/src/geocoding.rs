//! TomTom geocoding lookup used to resolve a place name to a bounding box.

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::Url;
use serde::Deserialize;
use traffic_types::{BoundingBox, GeoPoint};

use crate::{build_http_client, ensure_success, ApiEndpoint, SourceError};

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    #[serde(default)]
    results: Vec<GeocodeResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeocodeResult {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    match_confidence: Option<MatchConfidence>,
    #[serde(default)]
    bounding_box: Option<GeocodeBox>,
}

#[derive(Debug, Deserialize)]
struct MatchConfidence {
    #[serde(default)]
    score: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeocodeBox {
    top_left_point: GeoPoint,
    btm_right_point: GeoPoint,
}

#[derive(Debug, Clone)]
pub struct TomTomGeocodingClient {
    client: Client,
    endpoint: ApiEndpoint,
    api_key: String,
}

impl TomTomGeocodingClient {
    pub fn new(
        api_key: impl Into<String>,
        endpoint: ApiEndpoint,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        Ok(Self {
            client: build_http_client(timeout)?,
            endpoint,
            api_key: api_key.into(),
        })
    }

    /// Resolves `location` to the bounding box of its best `Geography` match.
    pub fn lookup_bounding_box(&self, location: &str) -> Result<BoundingBox, SourceError> {
        let url = self.location_url(location)?;
        let response = self
            .client
            .get(url)
            .query(&[("key", self.api_key.as_str())])
            .send()?;
        let body = ensure_success("geocoding", response)?.text()?;
        let parsed: GeocodeResponse = serde_json::from_str(&body)?;

        let bbox = best_geography_match(parsed.results)
            .ok_or_else(|| SourceError::NoGeographyMatch(location.to_string()))?;
        tracing::info!(location, bbox = %bbox, "resolved bounding box");
        Ok(bbox)
    }

    fn location_url(&self, location: &str) -> Result<Url, SourceError> {
        let base = self.endpoint.url();
        let mut url = Url::parse(&base).map_err(|_| SourceError::InvalidUrl(base.clone()))?;
        url.path_segments_mut()
            .map_err(|_| SourceError::InvalidUrl(base.clone()))?
            .push(&format!("{location}.json"));
        Ok(url)
    }
}

fn best_geography_match(results: Vec<GeocodeResult>) -> Option<BoundingBox> {
    results
        .into_iter()
        .filter(|result| result.kind == "Geography")
        .filter_map(|result| {
            let score = result
                .match_confidence
                .as_ref()
                .map_or(0.0, |confidence| confidence.score);
            result.bounding_box.map(|bbox| (score, bbox))
        })
        .max_by(|(left, _), (right, _)| left.total_cmp(right))
        .map(|(_, bbox)| BoundingBox::from_corners(bbox.top_left_point, bbox.btm_right_point))
}

#[cfg(test)]
mod tests {
    use super::TomTomGeocodingClient;
    use crate::{ApiEndpoint, SourceError};
    use httpmock::Method::GET;
    use httpmock::MockServer;
    use serde_json::json;
    use std::time::Duration;

    fn client(server: &MockServer) -> TomTomGeocodingClient {
        TomTomGeocodingClient::new(
            "geo-key",
            ApiEndpoint::tomtom_geocoding(&server.base_url()),
            Duration::from_secs(5),
        )
        .expect("build client")
    }

    #[test]
    fn functional_lookup_picks_highest_scoring_geography() {
        let server = MockServer::start();
        let geocode = server.mock(|when, then| {
            when.method(GET)
                .path("/search/2/geocode/Singapore.json")
                .query_param("key", "geo-key");
            then.status(200).json_body(json!({
                "results": [
                    {
                        "type": "POI",
                        "matchConfidence": { "score": 0.99 },
                        "boundingBox": {
                            "topLeftPoint": { "lat": 9.0, "lon": 9.0 },
                            "btmRightPoint": { "lat": 8.0, "lon": 10.0 }
                        }
                    },
                    {
                        "type": "Geography",
                        "matchConfidence": { "score": 0.4 },
                        "boundingBox": {
                            "topLeftPoint": { "lat": 5.0, "lon": 5.0 },
                            "btmRightPoint": { "lat": 4.0, "lon": 6.0 }
                        }
                    },
                    {
                        "type": "Geography",
                        "matchConfidence": { "score": 0.9 },
                        "boundingBox": {
                            "topLeftPoint": { "lat": 1.47, "lon": 103.6 },
                            "btmRightPoint": { "lat": 1.16, "lon": 104.1 }
                        }
                    }
                ]
            }));
        });

        let bbox = client(&server)
            .lookup_bounding_box("Singapore")
            .expect("bbox");
        geocode.assert_calls(1);
        assert_eq!(bbox.to_string(), "103.6,1.16,104.1,1.47");
    }

    #[test]
    fn regression_lookup_without_geography_result_is_an_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/search/2/geocode/Nowhere.json");
            then.status(200).json_body(json!({
                "results": [{ "type": "Street", "matchConfidence": { "score": 1.0 } }]
            }));
        });

        assert!(matches!(
            client(&server).lookup_bounding_box("Nowhere"),
            Err(SourceError::NoGeographyMatch(location)) if location == "Nowhere"
        ));
    }

    #[test]
    fn regression_lookup_surfaces_http_status() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/search/2/geocode/Singapore.json");
            then.status(500).body("upstream down");
        });

        assert!(matches!(
            client(&server).lookup_bounding_box("Singapore"),
            Err(SourceError::Status { status: 500, .. })
        ));
    }
}
