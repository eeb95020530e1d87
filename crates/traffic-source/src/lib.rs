//! HTTP collaborators: incident snapshots, geocoding, and camera images.

use std::time::Duration;

use reqwest::blocking::Client;
use thiserror::Error;
use traffic_types::{BoundingBox, IncidentRecord};

pub mod camera_images;
pub mod geocoding;
pub mod incidents;

pub use camera_images::{Camera, CameraDownloadSummary, CameraImageClient};
pub use geocoding::TomTomGeocodingClient;
pub use incidents::TomTomIncidentClient;

pub const DEFAULT_TOMTOM_BASE_URL: &str = "https://api.tomtom.com";
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{service} request failed with status {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },
    #[error("invalid request url '{0}'")]
    InvalidUrl(String),
    #[error("no geography result for location '{0}'")]
    NoGeographyMatch(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Provider of full incident snapshots for a region.
pub trait SnapshotSource {
    /// Returns every currently active incident inside `bbox`.
    ///
    /// An error means the snapshot is unusable as a whole; callers must not
    /// reconcile a partial result.
    fn fetch_snapshot(&self, bbox: &BoundingBox) -> Result<Vec<IncidentRecord>, SourceError>;
}

/// `{base_url}/{service}/{version}/{endpoint}` addressing used by TomTom APIs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiEndpoint {
    pub base_url: String,
    pub service: String,
    pub version: String,
    pub endpoint: String,
}

impl ApiEndpoint {
    pub fn tomtom_incidents(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            service: "traffic/services".to_string(),
            version: "5".to_string(),
            endpoint: "incidentDetails".to_string(),
        }
    }

    pub fn tomtom_geocoding(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            service: "search".to_string(),
            version: "2".to_string(),
            endpoint: "geocode".to_string(),
        }
    }

    pub fn url(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.service.trim_matches('/'),
            self.version.trim_matches('/'),
            self.endpoint.trim_matches('/')
        )
    }
}

pub(crate) fn build_http_client(timeout: Duration) -> Result<Client, SourceError> {
    Ok(Client::builder().timeout(timeout).build()?)
}

/// Turns a non-success response into `SourceError::Status`.
pub(crate) fn ensure_success(
    service: &'static str,
    response: reqwest::blocking::Response,
) -> Result<reqwest::blocking::Response, SourceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(SourceError::Status {
        service,
        status: status.as_u16(),
        body: truncate_body(&body),
    })
}

fn truncate_body(body: &str) -> String {
    const MAX_CHARS: usize = 512;
    if body.chars().count() <= MAX_CHARS {
        return body.to_string();
    }
    let mut truncated: String = body.chars().take(MAX_CHARS).collect();
    truncated.push_str("...");
    truncated
}
