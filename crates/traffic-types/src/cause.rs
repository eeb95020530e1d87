//! Icon category to reporting cause table.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENVIRONMENTAL_CAUSES: &str = "Environmental Causes";
pub const HUMAN_CAR_BREAKDOWNS: &str = "Human Car Breakdowns";
pub const JAMS: &str = "Jams";
pub const PLANNED_WORKS_CLOSURES: &str = "Planned Works Closures";
pub const UNKNOWN_CAUSES: &str = "Unknown Causes";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CauseMappingError {
    #[error("cause mapping has a group with an empty name")]
    EmptyName,
    #[error("cause mapping fallback name must not be empty")]
    EmptyFallback,
    #[error("cause '{0}' is defined more than once")]
    DuplicateCause(String),
    #[error("icon category {category} is mapped to both '{first}' and '{second}'")]
    OverlappingCategory {
        category: i64,
        first: String,
        second: String,
    },
    #[error("invalid cause mapping json: {0}")]
    Json(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CauseGroup {
    pub name: String,
    pub categories: Vec<i64>,
}

/// Configurable grouping of icon categories into report causes.
///
/// Categories that belong to no group, including the unknown sentinel `0`,
/// fall back to [`CauseMapping::fallback`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CauseMapping {
    pub groups: Vec<CauseGroup>,
    #[serde(default = "default_fallback")]
    pub fallback: String,
}

fn default_fallback() -> String {
    UNKNOWN_CAUSES.to_string()
}

impl Default for CauseMapping {
    fn default() -> Self {
        let group = |name: &str, categories: &[i64]| CauseGroup {
            name: name.to_string(),
            categories: categories.to_vec(),
        };
        Self {
            groups: vec![
                group(ENVIRONMENTAL_CAUSES, &[2, 3, 4, 5, 10, 11]),
                group(HUMAN_CAR_BREAKDOWNS, &[1, 14]),
                group(JAMS, &[6]),
                group(PLANNED_WORKS_CLOSURES, &[7, 8, 9]),
            ],
            fallback: default_fallback(),
        }
    }
}

impl CauseMapping {
    pub fn from_json_str(raw: &str) -> Result<Self, CauseMappingError> {
        let mapping: Self =
            serde_json::from_str(raw).map_err(|error| CauseMappingError::Json(error.to_string()))?;
        mapping.validate()?;
        Ok(mapping)
    }

    pub fn validate(&self) -> Result<(), CauseMappingError> {
        if self.fallback.trim().is_empty() {
            return Err(CauseMappingError::EmptyFallback);
        }
        let mut owners: HashMap<i64, &str> = HashMap::new();
        let mut names: Vec<&str> = Vec::new();
        for group in &self.groups {
            let name = group.name.trim();
            if name.is_empty() {
                return Err(CauseMappingError::EmptyName);
            }
            if names.contains(&name) {
                return Err(CauseMappingError::DuplicateCause(name.to_string()));
            }
            names.push(name);
            for category in &group.categories {
                if let Some(first) = owners.insert(*category, name) {
                    if first != name {
                        return Err(CauseMappingError::OverlappingCategory {
                            category: *category,
                            first: first.to_string(),
                            second: name.to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    pub fn cause_for(&self, category: i64) -> &str {
        self.groups
            .iter()
            .find(|group| group.categories.contains(&category))
            .map(|group| group.name.as_str())
            .unwrap_or(self.fallback.as_str())
    }

    /// Report column order: configured groups, then the fallback.
    pub fn cause_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.groups.iter().map(|group| group.name.as_str()).collect();
        if !names.contains(&self.fallback.as_str()) {
            names.push(self.fallback.as_str());
        }
        names
    }
}
