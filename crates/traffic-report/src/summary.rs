//! Hourly cause and delay breakdown of the incidents stored for a window.

use std::collections::BTreeMap;
use std::io::Write;

use chrono::{DateTime, DurationRound, SecondsFormat, TimeDelta, Utc};
use traffic_types::{CauseMapping, PersistedIncident};

use crate::{csv_row, ReportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SummaryWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, ReportError> {
        if start > end {
            return Err(ReportError::InvalidWindow { start, end });
        }
        Ok(Self { start, end })
    }
}

/// Aggregates for incidents whose start time falls in one hour.
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalSummary {
    pub interval_start: DateTime<Utc>,
    /// Counts aligned with [`WindowSummary::causes`].
    pub cause_counts: Vec<usize>,
    pub total: usize,
    pub incidents_with_delay: usize,
    pub total_delay: f64,
    pub average_delay: f64,
    pub mean_duration_minutes: f64,
}

impl IntervalSummary {
    /// Percentage of the interval's incidents per cause.
    pub fn cause_shares(&self) -> Vec<f64> {
        self.cause_counts
            .iter()
            .map(|count| {
                if self.total == 0 {
                    0.0
                } else {
                    *count as f64 / self.total as f64 * 100.0
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowSummary {
    pub window: SummaryWindow,
    pub causes: Vec<String>,
    pub intervals: Vec<IntervalSummary>,
}

#[derive(Default)]
struct Accumulator {
    cause_counts: Vec<usize>,
    total: usize,
    incidents_with_delay: usize,
    total_delay: f64,
    duration_minutes: f64,
}

impl WindowSummary {
    /// Buckets `incidents` by start time floored to the hour.
    ///
    /// Incidents still open are measured up to `now`.
    pub fn build(
        incidents: &[PersistedIncident],
        mapping: &CauseMapping,
        window: SummaryWindow,
        now: DateTime<Utc>,
    ) -> Self {
        let causes: Vec<String> = mapping
            .cause_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let mut buckets: BTreeMap<DateTime<Utc>, Accumulator> = BTreeMap::new();

        for row in incidents {
            let incident = &row.incident;
            let interval_start = floor_to_hour(incident.start_time);
            let bucket = buckets.entry(interval_start).or_insert_with(|| Accumulator {
                cause_counts: vec![0; causes.len()],
                ..Accumulator::default()
            });

            let cause = mapping.cause_for(incident.category);
            if let Some(index) = causes.iter().position(|name| name == cause) {
                bucket.cause_counts[index] += 1;
            }
            bucket.total += 1;
            if let Some(delay) = incident.delay.filter(|delay| *delay > 0.0) {
                bucket.incidents_with_delay += 1;
                bucket.total_delay += delay;
            }
            // Ends reported before the start count as zero-length.
            let end = incident.end_time.unwrap_or(now).max(incident.start_time);
            bucket.duration_minutes += (end - incident.start_time).num_seconds() as f64 / 60.0;
        }

        let intervals = buckets
            .into_iter()
            .map(|(interval_start, bucket)| IntervalSummary {
                interval_start,
                total: bucket.total,
                incidents_with_delay: bucket.incidents_with_delay,
                total_delay: bucket.total_delay,
                average_delay: if bucket.incidents_with_delay > 0 {
                    bucket.total_delay / bucket.incidents_with_delay as f64
                } else {
                    0.0
                },
                mean_duration_minutes: bucket.duration_minutes / bucket.total as f64,
                cause_counts: bucket.cause_counts,
            })
            .collect();

        Self {
            window,
            causes,
            intervals,
        }
    }

    pub fn total_incidents(&self) -> usize {
        self.intervals.iter().map(|interval| interval.total).sum()
    }

    pub fn write_csv<W: Write>(&self, mut sink: W) -> Result<(), ReportError> {
        let mut header = vec!["Interval".to_string()];
        header.extend(self.causes.iter().cloned());
        header.push("Total Causes".to_string());
        header.extend(self.causes.iter().map(|cause| format!("{cause} Share")));
        header.extend(
            [
                "Incidents with Delay",
                "Total Delay",
                "Average Delay",
                "Mean Duration (min)",
            ]
            .iter()
            .map(|column| column.to_string()),
        );
        sink.write_all(csv_row(&header).as_bytes())?;

        for interval in &self.intervals {
            let mut fields = vec![interval
                .interval_start
                .to_rfc3339_opts(SecondsFormat::Secs, true)];
            fields.extend(interval.cause_counts.iter().map(usize::to_string));
            fields.push(interval.total.to_string());
            fields.extend(
                interval
                    .cause_shares()
                    .iter()
                    .map(|share| format!("{share:.2}")),
            );
            fields.push(interval.incidents_with_delay.to_string());
            fields.push(interval.total_delay.to_string());
            fields.push(format!("{:.2}", interval.average_delay));
            fields.push(format!("{:.1}", interval.mean_duration_minutes));
            sink.write_all(csv_row(&fields).as_bytes())?;
        }
        sink.flush()?;
        Ok(())
    }
}

fn floor_to_hour(value: DateTime<Utc>) -> DateTime<Utc> {
    value
        .duration_trunc(TimeDelta::hours(1))
        .unwrap_or(value)
}
