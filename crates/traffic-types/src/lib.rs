//! Shared data types for traffic incident reconciliation.
//!
//! Holds the feed wire shape, the validated incident model, the merge rules
//! applied on every sighting, and the category-to-cause reporting table.

mod bbox;
mod cause;
mod incident;
pub mod merge;
mod record;

pub use bbox::{BoundingBox, BoundingBoxError, GeoPoint};
pub use cause::{
    CauseGroup, CauseMapping, CauseMappingError, ENVIRONMENTAL_CAUSES, HUMAN_CAR_BREAKDOWNS, JAMS,
    PLANNED_WORKS_CLOSURES, UNKNOWN_CAUSES,
};
pub use incident::{
    Geometry, Incident, IncidentEvent, PersistedIncident, Position, RecordError, TmcLocation,
};
pub use merge::{SightingDecision, StoredPeak, UpsertOutcome};
pub use record::{IncidentRecord, RecordEvent, RecordGeometry, RecordProperties, RecordTmc};

/// Icon category used when the feed omits one.
pub const UNKNOWN_ICON_CATEGORY: i64 = 0;
