use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use traffic_source::{ApiEndpoint, TomTomGeocodingClient, TomTomIncidentClient};
use traffic_store::SqliteIncidentStore;
use traffic_types::{BoundingBox, CauseMapping};

use crate::cli::SourceArgs;

pub(crate) fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

pub(crate) fn load_cause_mapping(path: Option<&Path>) -> Result<CauseMapping> {
    let Some(path) = path else {
        return Ok(CauseMapping::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read cause mapping {}", path.display()))?;
    CauseMapping::from_json_str(&raw)
        .with_context(|| format!("invalid cause mapping {}", path.display()))
}

pub(crate) fn open_store(db_path: &Path) -> Result<SqliteIncidentStore> {
    SqliteIncidentStore::open(db_path)
        .with_context(|| format!("failed to open incident store {}", db_path.display()))
}

pub(crate) fn require_api_key(source: &SourceArgs) -> Result<&str> {
    source
        .api_key
        .as_deref()
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .context("a TomTom API key is required: pass --api-key or set TOMTOM_API_KEY")
}

pub(crate) fn build_incident_client(source: &SourceArgs) -> Result<TomTomIncidentClient> {
    let client = TomTomIncidentClient::new(
        require_api_key(source)?,
        ApiEndpoint::tomtom_incidents(&source.base_url),
        Duration::from_millis(source.http_timeout_ms),
    )
    .context("failed to build incident http client")?;
    Ok(client.with_language(source.language.clone()))
}

/// Uses `--bbox` when given, otherwise geocodes `--location`.
pub(crate) fn resolve_bounding_box(source: &SourceArgs) -> Result<BoundingBox> {
    if let Some(bbox) = source.bbox {
        return Ok(bbox);
    }
    let client = TomTomGeocodingClient::new(
        require_api_key(source)?,
        ApiEndpoint::tomtom_geocoding(&source.base_url),
        Duration::from_millis(source.http_timeout_ms),
    )
    .context("failed to build geocoding http client")?;
    client
        .lookup_bounding_box(&source.location)
        .with_context(|| format!("failed to resolve bounding box for '{}'", source.location))
}
