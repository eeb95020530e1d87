//! Traffic camera image downloader for the data.gov.sg traffic-images API.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::{build_http_client, ensure_success, SourceError};

pub const DEFAULT_CAMERA_API_URL: &str = "https://api.data.gov.sg/v1/transport/traffic-images";

#[derive(Debug, Deserialize)]
struct CameraResponse {
    #[serde(default)]
    items: Vec<CameraItem>,
}

#[derive(Debug, Deserialize)]
struct CameraItem {
    #[serde(default)]
    cameras: Vec<Camera>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Camera {
    #[serde(default)]
    pub camera_id: Value,
    #[serde(default)]
    pub image_id: Value,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl Camera {
    /// File name the image is stored under.
    pub fn file_name(&self) -> String {
        format!(
            "camera_{}_image_{}.jpg",
            id_text(&self.camera_id),
            id_text(&self.image_id)
        )
    }
}

fn id_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => "unknown".to_string(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CameraDownloadSummary {
    pub saved: Vec<PathBuf>,
    /// Cameras whose image could not be fetched or written.
    pub failed: usize,
    /// Cameras listed without an image URL.
    pub missing_url: usize,
}

#[derive(Debug, Clone)]
pub struct CameraImageClient {
    client: Client,
    api_url: String,
}

impl CameraImageClient {
    pub fn new(api_url: impl Into<String>, timeout: Duration) -> Result<Self, SourceError> {
        Ok(Self {
            client: build_http_client(timeout)?,
            api_url: api_url.into(),
        })
    }

    /// Lists the cameras of the first snapshot item at `at`.
    pub fn fetch_cameras(&self, at: DateTime<Utc>) -> Result<Vec<Camera>, SourceError> {
        let date_time = at.format("%Y-%m-%dT%H:%M:%S").to_string();
        let response = self
            .client
            .get(&self.api_url)
            .query(&[("date_time", date_time.as_str())])
            .send()?;
        let body = ensure_success("traffic images", response)?.text()?;
        let parsed: CameraResponse = serde_json::from_str(&body)?;
        Ok(parsed
            .items
            .into_iter()
            .next()
            .map(|item| item.cameras)
            .unwrap_or_default())
    }

    /// Downloads every camera image into `dir`.
    ///
    /// Only the listing request is fatal; each image is attempted independently.
    pub fn download_all(
        &self,
        at: DateTime<Utc>,
        dir: &Path,
    ) -> Result<CameraDownloadSummary, SourceError> {
        let cameras = self.fetch_cameras(at)?;
        fs::create_dir_all(dir)?;
        if cameras.is_empty() {
            tracing::warn!("no cameras listed in traffic images response");
        }

        let mut summary = CameraDownloadSummary::default();
        for camera in &cameras {
            let Some(image_url) = camera.image.as_deref() else {
                tracing::warn!(camera_id = %id_text(&camera.camera_id), "camera has no image url");
                summary.missing_url += 1;
                continue;
            };
            let path = dir.join(camera.file_name());
            match self.download_image(image_url, &path) {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), "saved camera image");
                    summary.saved.push(path);
                }
                Err(error) => {
                    tracing::error!(image_url, %error, "failed to download camera image");
                    summary.failed += 1;
                }
            }
        }
        tracing::info!(
            saved = summary.saved.len(),
            failed = summary.failed,
            missing_url = summary.missing_url,
            dir = %dir.display(),
            "camera image download finished"
        );
        Ok(summary)
    }

    fn download_image(&self, url: &str, path: &Path) -> Result<(), SourceError> {
        let response = self.client.get(url).send()?;
        let bytes = ensure_success("camera image", response)?.bytes()?;
        fs::write(path, &bytes)?;
        Ok(())
    }
}
