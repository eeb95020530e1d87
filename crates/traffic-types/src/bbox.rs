use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BoundingBoxError {
    #[error("bounding box must have 4 comma-separated numbers, found {0}")]
    WrongArity(usize),
    #[error("bounding box component '{0}' is not a finite number")]
    InvalidNumber(String),
    #[error("bounding box is inverted: {0}")]
    Inverted(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

/// Region filter in EPSG:4326, rendered as `min_lon,min_lat,max_lon,max_lat`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    /// Builds a box from two opposite corners in any order.
    pub fn from_corners(first: GeoPoint, second: GeoPoint) -> Self {
        Self {
            min_lon: first.lon.min(second.lon),
            min_lat: first.lat.min(second.lat),
            max_lon: first.lon.max(second.lon),
            max_lat: first.lat.max(second.lat),
        }
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.min_lon, self.min_lat, self.max_lon, self.max_lat
        )
    }
}

impl FromStr for BoundingBox {
    type Err = BoundingBoxError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = value.split(',').map(str::trim).collect();
        if parts.len() != 4 {
            return Err(BoundingBoxError::WrongArity(parts.len()));
        }
        let numbers = parts
            .iter()
            .map(|part| {
                part.parse::<f64>()
                    .ok()
                    .filter(|number| number.is_finite())
                    .ok_or_else(|| BoundingBoxError::InvalidNumber(part.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let bbox = Self {
            min_lon: numbers[0],
            min_lat: numbers[1],
            max_lon: numbers[2],
            max_lat: numbers[3],
        };
        if bbox.min_lon > bbox.max_lon || bbox.min_lat > bbox.max_lat {
            return Err(BoundingBoxError::Inverted(value.to_string()));
        }
        Ok(bbox)
    }
}
