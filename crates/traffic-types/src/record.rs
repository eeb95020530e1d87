//! Wire shape of one incident as returned by the incident details feed.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// One incident feature exactly as received from the snapshot source.
///
/// Every field is optional on the wire; validation happens in
/// [`crate::Incident::from_record`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncidentRecord {
    #[serde(rename = "type", default)]
    pub feature_type: Option<String>,
    #[serde(default)]
    pub geometry: Option<RecordGeometry>,
    #[serde(default)]
    pub properties: RecordProperties,
}

impl IncidentRecord {
    /// Identifier as reported upstream, possibly empty.
    pub fn id(&self) -> &str {
        self.properties.id.as_deref().unwrap_or_default()
    }

    /// Delay used for snapshot statistics, null counted as zero.
    pub fn delay_or_zero(&self) -> f64 {
        self.properties
            .delay
            .filter(|delay| delay.is_finite() && *delay > 0.0)
            .unwrap_or(0.0)
    }

    /// Icon category with the unknown sentinel applied.
    pub fn icon_category_or_unknown(&self) -> i64 {
        self.properties
            .icon_category
            .unwrap_or(crate::UNKNOWN_ICON_CATEGORY)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordGeometry {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub coordinates: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordProperties {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub icon_category: Option<i64>,
    #[serde(default)]
    pub magnitude_of_delay: Option<i64>,
    #[serde(default)]
    pub events: Option<Vec<RecordEvent>>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub length: Option<f64>,
    #[serde(default)]
    pub delay: Option<f64>,
    #[serde(default)]
    pub road_numbers: Option<Vec<String>>,
    #[serde(default)]
    pub time_validity: Option<String>,
    #[serde(default)]
    pub probability_of_occurrence: Option<String>,
    #[serde(default)]
    pub number_of_reports: Option<i64>,
    #[serde(default)]
    pub last_report_time: Option<String>,
    #[serde(default)]
    pub tmc: Option<RecordTmc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordEvent {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub icon_category: Option<i64>,
}

/// Traffic-message-channel location reference.
///
/// The feed has reported table numbers both as strings and as integers, so
/// the scalar fields accept either.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordTmc {
    #[serde(default, deserialize_with = "string_or_number")]
    pub country_code: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub table_number: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub table_version: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub direction: Option<String>,
    #[serde(default)]
    pub points: Option<Vec<Value>>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => Ok(Some(text)),
        Some(Value::Number(number)) => Ok(Some(number.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string or number, found {other}"
        ))),
    }
}
