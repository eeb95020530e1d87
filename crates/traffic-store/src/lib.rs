//! Incident reconciliation store abstractions and in-memory backend.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use traffic_types::merge::{decide_sighting, expiry_cutoff, is_stale, synthesized_end_time};
use traffic_types::{
    Incident, IncidentRecord, PersistedIncident, SightingDecision, StoredPeak, UpsertOutcome,
};

mod export;
mod sqlite;

pub use export::{export_geojson, feature_collection, ExportSummary};
pub use sqlite::SqliteIncidentStore;

/// Result type for incident store operations.
pub type StoreResult<T> = Result<T, IncidentStoreError>;

/// Errors returned by store implementations.
#[derive(Debug, Error)]
pub enum IncidentStoreError {
    #[error("expiry threshold {0:?} is out of range")]
    InvalidThreshold(Duration),
    #[error("window start {start} is after window end {end}")]
    InvalidWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("invalid persisted value for '{field}': {value}")]
    InvalidPersistedValue { field: &'static str, value: String },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Chrono(#[from] chrono::ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Totals for one whole-snapshot reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileTotals {
    pub seen: usize,
    pub changed: usize,
    pub inserted: usize,
    /// Records dropped by validation.
    pub skipped: usize,
    /// Records whose write failed at the storage layer.
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredIncident {
    pub id: String,
    pub end_time: DateTime<Utc>,
}

/// Outcome of one expiry sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpirySweep {
    pub expired: Vec<ExpiredIncident>,
    /// Rows skipped because their stored timestamps could not be parsed.
    pub corrupt_skipped: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartTimeBounds {
    pub earliest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
}

/// A stored row that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptRow {
    pub id: String,
    pub reason: String,
}

/// Rows whose start or end time falls in a window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IncidentWindow {
    pub incidents: Vec<PersistedIncident>,
    pub corrupt: Vec<CorruptRow>,
}

/// Store contract used by the cycle driver, exporter, and reports.
///
/// Backends implement the storage primitives; the per-record validation,
/// error isolation, and snapshot totals are shared provided methods.
pub trait IncidentStore {
    /// Applies one validated sighting in a single durable write.
    fn record_sighting(
        &mut self,
        incident: &Incident,
        now: DateTime<Utc>,
    ) -> StoreResult<UpsertOutcome>;

    /// Stamps an end time on every open incident not seen for `threshold`.
    fn expire_stale_at(
        &mut self,
        threshold: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<ExpirySweep>;

    fn get_incident(&self, id: &str) -> StoreResult<Option<PersistedIncident>>;
    fn incident_count(&self) -> StoreResult<usize>;
    fn start_time_bounds(&self) -> StoreResult<StartTimeBounds>;
    fn incidents_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<IncidentWindow>;

    /// Reconciles one feed record at `now`.
    ///
    /// Malformed records and storage failures are logged and reported as
    /// neither changed nor inserted.
    fn upsert_at(&mut self, record: &IncidentRecord, now: DateTime<Utc>) -> UpsertOutcome {
        match reconcile_record(self, record, now) {
            RecordResult::Applied(outcome) => outcome,
            RecordResult::Malformed | RecordResult::Failed => UpsertOutcome::default(),
        }
    }

    fn upsert(&mut self, record: &IncidentRecord) -> UpsertOutcome {
        self.upsert_at(record, Utc::now())
    }

    /// Reconciles a whole snapshot, one record at a time.
    fn update_incidents_at(
        &mut self,
        records: &[IncidentRecord],
        now: DateTime<Utc>,
    ) -> ReconcileTotals {
        let mut totals = ReconcileTotals {
            seen: records.len(),
            ..ReconcileTotals::default()
        };
        for record in records {
            match reconcile_record(self, record, now) {
                RecordResult::Applied(outcome) => {
                    totals.changed += usize::from(outcome.changed);
                    totals.inserted += usize::from(outcome.inserted);
                }
                RecordResult::Malformed => totals.skipped += 1,
                RecordResult::Failed => totals.failed += 1,
            }
        }
        tracing::info!(
            inserted = totals.inserted,
            changed = totals.changed,
            current = totals.seen,
            skipped = totals.skipped,
            failed = totals.failed,
            "{} new incident(s) inserted of {} changes (of {} current)",
            totals.inserted,
            totals.changed,
            totals.seen
        );
        totals
    }

    fn update_incidents(&mut self, records: &[IncidentRecord]) -> ReconcileTotals {
        self.update_incidents_at(records, Utc::now())
    }

    fn expire_stale(&mut self, threshold: Duration) -> StoreResult<ExpirySweep> {
        self.expire_stale_at(threshold, Utc::now())
    }
}

enum RecordResult {
    Applied(UpsertOutcome),
    Malformed,
    Failed,
}

fn reconcile_record<S: IncidentStore + ?Sized>(
    store: &mut S,
    record: &IncidentRecord,
    now: DateTime<Utc>,
) -> RecordResult {
    let incident = match Incident::from_record(record) {
        Ok(incident) => incident,
        Err(error) => {
            tracing::warn!(incident_id = record.id(), %error, "skipping malformed incident record");
            return RecordResult::Malformed;
        }
    };
    match store.record_sighting(&incident, now) {
        Ok(outcome) => RecordResult::Applied(outcome),
        Err(error) => {
            tracing::error!(
                incident_id = %incident.id,
                delay = ?incident.delay,
                start_time = %incident.start_time,
                error = %error,
                error_debug = ?error,
                "failed to persist incident sighting"
            );
            RecordResult::Failed
        }
    }
}

/// Threshold as a signed delta plus the staleness cutoff at `now`; both must
/// stay inside chrono's representable range.
pub(crate) fn expiry_window(
    threshold: Duration,
    now: DateTime<Utc>,
) -> StoreResult<(TimeDelta, DateTime<Utc>)> {
    let invalid = || IncidentStoreError::InvalidThreshold(threshold);
    let delta = TimeDelta::from_std(threshold).map_err(|_| invalid())?;
    let cutoff = expiry_cutoff(now, delta).ok_or_else(invalid)?;
    Ok((delta, cutoff))
}

pub(crate) fn ensure_window(start: DateTime<Utc>, end: DateTime<Utc>) -> StoreResult<()> {
    if start > end {
        return Err(IncidentStoreError::InvalidWindow { start, end });
    }
    Ok(())
}

/// In-memory implementation for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryIncidentStore {
    incidents: BTreeMap<String, PersistedIncident>,
}

impl InMemoryIncidentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IncidentStore for InMemoryIncidentStore {
    fn record_sighting(
        &mut self,
        incident: &Incident,
        now: DateTime<Utc>,
    ) -> StoreResult<UpsertOutcome> {
        let stored = self.incidents.get(&incident.id).map(|row| StoredPeak {
            delay: row.incident.delay,
            end_time: row.incident.end_time,
        });
        let decision = decide_sighting(stored.as_ref(), incident);
        match decision {
            SightingDecision::Insert => {
                self.incidents.insert(
                    incident.id.clone(),
                    PersistedIncident {
                        incident: incident.clone(),
                        last_seen: Some(now),
                    },
                );
            }
            SightingDecision::Escalate { end_time } => {
                let mut replacement = incident.clone();
                replacement.end_time = end_time;
                self.incidents.insert(
                    incident.id.clone(),
                    PersistedIncident {
                        incident: replacement,
                        last_seen: Some(now),
                    },
                );
            }
            SightingDecision::Refresh => {
                if let Some(row) = self.incidents.get_mut(&incident.id) {
                    row.last_seen = Some(now);
                }
            }
        }
        Ok(decision.outcome())
    }

    fn expire_stale_at(
        &mut self,
        threshold: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<ExpirySweep> {
        let (threshold, _) = expiry_window(threshold, now)?;
        let mut sweep = ExpirySweep::default();
        for (id, row) in &mut self.incidents {
            if row.incident.end_time.is_some() {
                continue;
            }
            let Some(last_seen) = row.last_seen else {
                continue;
            };
            if !is_stale(last_seen, now, threshold) {
                continue;
            }
            let end_time =
                synthesized_end_time(row.incident.start_time, row.last_seen, threshold);
            row.incident.end_time = Some(end_time);
            sweep.expired.push(ExpiredIncident {
                id: id.clone(),
                end_time,
            });
        }
        Ok(sweep)
    }

    fn get_incident(&self, id: &str) -> StoreResult<Option<PersistedIncident>> {
        Ok(self.incidents.get(id).cloned())
    }

    fn incident_count(&self) -> StoreResult<usize> {
        Ok(self.incidents.len())
    }

    fn start_time_bounds(&self) -> StoreResult<StartTimeBounds> {
        let starts = self.incidents.values().map(|row| row.incident.start_time);
        Ok(StartTimeBounds {
            earliest: starts.clone().min(),
            latest: starts.max(),
        })
    }

    fn incidents_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<IncidentWindow> {
        ensure_window(start, end)?;
        let in_range = |value: DateTime<Utc>| value >= start && value <= end;
        let mut incidents: Vec<PersistedIncident> = self
            .incidents
            .values()
            .filter(|row| {
                in_range(row.incident.start_time) || row.incident.end_time.is_some_and(in_range)
            })
            .cloned()
            .collect();
        incidents.sort_by(|left, right| {
            left.incident
                .start_time
                .cmp(&right.incident.start_time)
                .then_with(|| left.incident.id.cmp(&right.incident.id))
        });
        Ok(IncidentWindow {
            incidents,
            corrupt: Vec::new(),
        })
    }
}
