//! Validated incident model shared by the store, exporter, and reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::record::{IncidentRecord, RecordEvent, RecordTmc};
use crate::UNKNOWN_ICON_CATEGORY;

/// Reasons a feed record cannot be reconciled.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordError {
    #[error("incident record has no identifier")]
    MissingId,
    #[error("incident '{id}' has no geometry")]
    MissingGeometry { id: String },
    #[error("incident '{id}' has unsupported geometry type '{kind}'")]
    UnsupportedGeometry { id: String, kind: String },
    #[error("incident '{id}' has malformed coordinates: {reason}")]
    MalformedCoordinates { id: String, reason: String },
    #[error("incident '{id}' has no start time")]
    MissingStartTime { id: String },
    #[error("incident '{id}' has invalid {field} '{value}': {source}")]
    InvalidTimestamp {
        id: String,
        field: &'static str,
        value: String,
        source: chrono::ParseError,
    },
}

/// A single `[lon, lat, ...]` coordinate tuple.
pub type Position = Vec<f64>;

/// Incident geometry, serialized in GeoJSON form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum Geometry {
    Point(Position),
    LineString(Vec<Position>),
}

impl Geometry {
    /// Builds a geometry from a type tag and a raw coordinate value.
    pub fn from_parts(kind: &str, coordinates: &Value) -> Result<Self, String> {
        match kind {
            "Point" => parse_position(coordinates).map(Self::Point),
            "LineString" => {
                let items = coordinates
                    .as_array()
                    .ok_or_else(|| "LineString coordinates must be an array".to_string())?;
                if items.len() < 2 {
                    return Err(format!(
                        "LineString needs at least 2 positions, found {}",
                        items.len()
                    ));
                }
                items
                    .iter()
                    .map(parse_position)
                    .collect::<Result<Vec<_>, _>>()
                    .map(Self::LineString)
            }
            other => Err(format!("unsupported geometry type '{other}'")),
        }
    }

    /// Decodes a geometry persisted as a type tag plus JSON coordinate text.
    pub fn from_stored(kind: &str, coordinates_json: &str) -> Result<Self, String> {
        let coordinates: Value = serde_json::from_str(coordinates_json)
            .map_err(|error| format!("coordinates are not valid JSON: {error}"))?;
        Self::from_parts(kind, &coordinates)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Point(_) => "Point",
            Self::LineString(_) => "LineString",
        }
    }

    /// JSON text of the coordinate payload, as persisted.
    pub fn coordinates_json(&self) -> String {
        let value = match self {
            Self::Point(position) => serde_json::json!(position),
            Self::LineString(positions) => serde_json::json!(positions),
        };
        value.to_string()
    }
}

fn parse_position(value: &Value) -> Result<Position, String> {
    let items = value
        .as_array()
        .ok_or_else(|| format!("position must be an array, found {value}"))?;
    if items.len() < 2 {
        return Err(format!(
            "position needs at least 2 numbers, found {}",
            items.len()
        ));
    }
    items
        .iter()
        .map(|item| {
            item.as_f64()
                .filter(|number| number.is_finite())
                .ok_or_else(|| format!("position component {item} is not a finite number"))
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentEvent {
    pub description: Option<String>,
    pub code: Option<i64>,
    pub icon_category: Option<i64>,
}

impl From<&RecordEvent> for IncidentEvent {
    fn from(event: &RecordEvent) -> Self {
        Self {
            description: event.description.clone(),
            code: event.code,
            icon_category: event.icon_category,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TmcLocation {
    pub country_code: Option<String>,
    pub table_number: Option<String>,
    pub table_version: Option<String>,
    pub direction: Option<String>,
}

impl From<&RecordTmc> for TmcLocation {
    fn from(tmc: &RecordTmc) -> Self {
        Self {
            country_code: tmc.country_code.clone(),
            table_number: tmc.table_number.clone(),
            table_version: tmc.table_version.clone(),
            direction: tmc.direction.clone(),
        }
    }
}

/// An incident record after validation and defaulting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub category: i64,
    pub geometry: Geometry,
    pub magnitude_of_delay: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub from_location: Option<String>,
    pub to_location: Option<String>,
    pub length: Option<f64>,
    pub delay: Option<f64>,
    pub road_numbers: Vec<String>,
    pub time_validity: Option<String>,
    pub probability_of_occurrence: Option<String>,
    pub number_of_reports: i64,
    pub last_report_time: Option<String>,
    pub events: Vec<IncidentEvent>,
    pub tmc: Option<TmcLocation>,
}

impl Incident {
    /// Validates a feed record.
    ///
    /// Negative or non-finite delays are dropped rather than rejected, since
    /// the rest of the record is still a valid sighting.
    pub fn from_record(record: &IncidentRecord) -> Result<Self, RecordError> {
        let properties = &record.properties;
        let id = properties
            .id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or(RecordError::MissingId)?
            .to_string();

        let geometry = record
            .geometry
            .as_ref()
            .ok_or_else(|| RecordError::MissingGeometry { id: id.clone() })?;
        let geometry = match geometry.kind.as_str() {
            "Point" | "LineString" => Geometry::from_parts(&geometry.kind, &geometry.coordinates)
                .map_err(|reason| RecordError::MalformedCoordinates {
                    id: id.clone(),
                    reason,
                })?,
            other => {
                return Err(RecordError::UnsupportedGeometry {
                    id,
                    kind: other.to_string(),
                })
            }
        };

        let start_time = properties
            .start_time
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| RecordError::MissingStartTime { id: id.clone() })
            .and_then(|value| parse_feed_timestamp(&id, "startTime", value))?;
        let end_time = properties
            .end_time
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .map(|value| parse_feed_timestamp(&id, "endTime", value))
            .transpose()?;

        Ok(Self {
            category: properties.icon_category.unwrap_or(UNKNOWN_ICON_CATEGORY),
            geometry,
            magnitude_of_delay: properties.magnitude_of_delay.unwrap_or(0),
            start_time,
            end_time,
            from_location: properties.from.clone(),
            to_location: properties.to.clone(),
            length: properties.length,
            delay: properties
                .delay
                .filter(|delay| delay.is_finite() && *delay >= 0.0),
            road_numbers: properties.road_numbers.clone().unwrap_or_default(),
            time_validity: properties.time_validity.clone(),
            probability_of_occurrence: properties.probability_of_occurrence.clone(),
            number_of_reports: properties.number_of_reports.unwrap_or(0),
            last_report_time: properties.last_report_time.clone(),
            events: properties
                .events
                .as_deref()
                .unwrap_or_default()
                .iter()
                .map(IncidentEvent::from)
                .collect(),
            tmc: properties.tmc.as_ref().map(TmcLocation::from),
            id,
        })
    }
}

fn parse_feed_timestamp(
    id: &str,
    field: &'static str,
    value: &str,
) -> Result<DateTime<Utc>, RecordError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|source| RecordError::InvalidTimestamp {
            id: id.to_string(),
            field,
            value: value.to_string(),
            source,
        })
}

/// Durable view of one incident, one per identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedIncident {
    /// Fields from the sighting that produced the current delay peak.
    /// `incident.end_time` may have been synthesized by the expiry sweep.
    pub incident: Incident,
    pub last_seen: Option<DateTime<Utc>>,
}

impl PersistedIncident {
    pub fn is_ended(&self) -> bool {
        self.incident.end_time.is_some()
    }
}
