use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use traffic_report::{CsvReport, CycleStats};
use traffic_source::SnapshotSource;
use traffic_store::{IncidentStore, ReconcileTotals};
use traffic_types::{BoundingBox, CauseMapping};

/// Result of one reconciliation cycle.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CycleOutcome {
    /// The snapshot could not be fetched; the store was not touched.
    Skipped { reason: String },
    Reconciled(CycleSummary),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CycleSummary {
    pub(crate) totals: ReconcileTotals,
    pub(crate) expired: usize,
    pub(crate) corrupt_skipped: usize,
    pub(crate) stats: CycleStats,
    pub(crate) report_written: bool,
}

/// Owns the collaborators of one polling loop and runs cycles on demand.
pub(crate) struct CycleDriver<Src, Store> {
    source: Src,
    store: Store,
    bbox: BoundingBox,
    mapping: CauseMapping,
    report: Option<CsvReport>,
    expiry_threshold: Duration,
}

impl<Src, Store> CycleDriver<Src, Store>
where
    Src: SnapshotSource,
    Store: IncidentStore,
{
    pub(crate) fn new(
        source: Src,
        store: Store,
        bbox: BoundingBox,
        mapping: CauseMapping,
        report: Option<CsvReport>,
        expiry_threshold: Duration,
    ) -> Self {
        Self {
            source,
            store,
            bbox,
            mapping,
            report,
            expiry_threshold,
        }
    }

    /// Fetch, reconcile, expire, then report. Never fails as a whole.
    pub(crate) fn run_cycle(&mut self, now: DateTime<Utc>) -> CycleOutcome {
        let records = match self.source.fetch_snapshot(&self.bbox) {
            Ok(records) => records,
            Err(error) => {
                tracing::error!(bbox = %self.bbox, %error, "snapshot fetch failed; skipping cycle");
                return CycleOutcome::Skipped {
                    reason: error.to_string(),
                };
            }
        };

        let stats = CycleStats::from_snapshot(&records, &self.mapping);
        let totals = self.store.update_incidents_at(&records, now);
        let (expired, corrupt_skipped) =
            match self.store.expire_stale_at(self.expiry_threshold, now) {
                Ok(sweep) => (sweep.expired.len(), sweep.corrupt_skipped),
                Err(error) => {
                    tracing::error!(%error, "expiry sweep failed");
                    (0, 0)
                }
            };

        let report_written = match &self.report {
            Some(report) => match report.append(
                &now.with_timezone(&Local),
                &stats,
                totals.changed,
                totals.inserted,
            ) {
                Ok(()) => true,
                Err(error) => {
                    tracing::error!(path = %report.path().display(), %error, "failed to append cycle report row");
                    false
                }
            },
            None => false,
        };

        CycleOutcome::Reconciled(CycleSummary {
            totals,
            expired,
            corrupt_skipped,
            stats,
            report_written,
        })
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    pub(crate) fn into_store(self) -> Store {
        self.store
    }
}
