use std::fmt::Display;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone};
use traffic_types::{CauseMapping, IncidentRecord};

use crate::{csv_row, ReportError};

pub const REPORT_FILE_NAME: &str = "report.csv";

/// Aggregates over one raw snapshot, before reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleStats {
    pub total_incidents: usize,
    pub incidents_with_delay: usize,
    pub total_delay: f64,
    /// Mean over incidents with a positive delay; zero when there are none.
    pub average_delay: f64,
    /// Count per cause, in `CauseMapping::cause_names` order.
    pub cause_counts: Vec<(String, usize)>,
}

impl CycleStats {
    pub fn from_snapshot(records: &[IncidentRecord], mapping: &CauseMapping) -> Self {
        let mut cause_counts: Vec<(String, usize)> = mapping
            .cause_names()
            .into_iter()
            .map(|name| (name.to_string(), 0))
            .collect();
        let mut incidents_with_delay = 0;
        let mut total_delay = 0.0;

        for record in records {
            let delay = record.delay_or_zero();
            if delay > 0.0 {
                incidents_with_delay += 1;
                total_delay += delay;
            }
            let cause = mapping.cause_for(record.icon_category_or_unknown());
            if let Some((_, count)) = cause_counts.iter_mut().find(|(name, _)| name == cause) {
                *count += 1;
            }
        }

        let average_delay = if incidents_with_delay > 0 {
            total_delay / incidents_with_delay as f64
        } else {
            0.0
        };
        Self {
            total_incidents: records.len(),
            incidents_with_delay,
            total_delay,
            average_delay,
            cause_counts,
        }
    }

    pub fn cause_count(&self, cause: &str) -> usize {
        self.cause_counts
            .iter()
            .find(|(name, _)| name == cause)
            .map_or(0, |(_, count)| *count)
    }
}

/// Append-only `report.csv` with one row per reconciled cycle.
#[derive(Debug, Clone)]
pub struct CsvReport {
    path: PathBuf,
    header: Vec<String>,
}

impl CsvReport {
    /// Opens `dir/report.csv`, writing the header row when the file is new.
    pub fn open(dir: &Path, mapping: &CauseMapping) -> Result<Self, ReportError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(REPORT_FILE_NAME);
        let header = report_header(mapping);
        let report = Self { path, header };

        if report.path.exists() {
            report.check_existing_header()?;
        } else {
            fs::write(&report.path, csv_row(&report.header))?;
            tracing::info!(path = %report.path.display(), "created cycle report with headers");
        }
        Ok(report)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    fn check_existing_header(&self) -> Result<(), ReportError> {
        let file = fs::File::open(&self.path)?;
        let mut first_line = String::new();
        BufReader::new(file).read_line(&mut first_line)?;
        let expected = csv_row(&self.header);
        if first_line.trim_end() != expected.trim_end() {
            tracing::warn!(
                path = %self.path.display(),
                found = first_line.trim_end(),
                expected = expected.trim_end(),
                "existing cycle report has a different header; appending anyway"
            );
        }
        Ok(())
    }

    /// Appends one cycle row.
    pub fn append<Tz>(
        &self,
        timestamp: &DateTime<Tz>,
        stats: &CycleStats,
        changes: usize,
        inserts: usize,
    ) -> Result<(), ReportError>
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        let mut fields = vec![
            timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            stats.total_incidents.to_string(),
            stats.incidents_with_delay.to_string(),
            stats.total_delay.to_string(),
            stats.average_delay.to_string(),
        ];
        fields.extend(self.header[5..self.header.len() - 2].iter().map(|cause| {
            stats.cause_count(cause).to_string()
        }));
        fields.push(changes.to_string());
        fields.push(inserts.to_string());

        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(csv_row(&fields).as_bytes())?;
        tracing::info!(path = %self.path.display(), "stats logged to cycle report");
        Ok(())
    }
}

fn report_header(mapping: &CauseMapping) -> Vec<String> {
    let mut header: Vec<String> = [
        "Timestamp",
        "Current Incidents",
        "Incidents with Delay",
        "Total Delay",
        "Average Delay",
    ]
    .iter()
    .map(|column| column.to_string())
    .collect();
    header.extend(mapping.cause_names().into_iter().map(str::to_string));
    header.push("Changes".to_string());
    header.push("New Incidents".to_string());
    header
}

#[cfg(test)]
mod tests {
    use super::{CsvReport, CycleStats};
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use tempfile::tempdir;
    use traffic_types::{CauseMapping, IncidentRecord, JAMS, UNKNOWN_CAUSES};

    fn record(category: Option<i64>, delay: Option<f64>) -> IncidentRecord {
        serde_json::from_value(json!({
            "properties": { "id": "x", "iconCategory": category, "delay": delay }
        }))
        .expect("decode record")
    }

    #[test]
    fn functional_cycle_stats_aggregate_delay_and_causes() {
        let records = vec![
            record(Some(6), Some(120.0)),
            record(Some(6), None),
            record(Some(8), Some(60.0)),
            record(None, Some(0.0)),
            record(Some(13), Some(-5.0)),
        ];
        let stats = CycleStats::from_snapshot(&records, &CauseMapping::default());
        assert_eq!(stats.total_incidents, 5);
        assert_eq!(stats.incidents_with_delay, 2);
        assert_eq!(stats.total_delay, 180.0);
        assert_eq!(stats.average_delay, 90.0);
        assert_eq!(stats.cause_count(JAMS), 2);
        assert_eq!(stats.cause_count("Planned Works Closures"), 1);
        assert_eq!(stats.cause_count(UNKNOWN_CAUSES), 2);
    }

    #[test]
    fn unit_cycle_stats_of_empty_snapshot_are_zero() {
        let stats = CycleStats::from_snapshot(&[], &CauseMapping::default());
        assert_eq!(stats.total_incidents, 0);
        assert_eq!(stats.average_delay, 0.0);
        assert!(stats.cause_counts.iter().all(|(_, count)| *count == 0));
    }

    #[test]
    fn integration_report_writes_header_once_and_appends_rows() {
        let temp = tempdir().expect("tempdir");
        let mapping = CauseMapping::default();
        let stats = CycleStats::from_snapshot(&[record(Some(6), Some(30.0))], &mapping);
        let timestamp = Utc.with_ymd_and_hms(2024, 12, 18, 13, 31, 55).unwrap();

        let report = CsvReport::open(temp.path(), &mapping).expect("open report");
        report.append(&timestamp, &stats, 1, 1).expect("append");
        let reopened = CsvReport::open(temp.path(), &mapping).expect("reopen report");
        reopened.append(&timestamp, &stats, 0, 0).expect("append");

        let contents = std::fs::read_to_string(report.path()).expect("read report");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(
            lines,
            vec![
                "Timestamp,Current Incidents,Incidents with Delay,Total Delay,Average Delay,Environmental Causes,Human Car Breakdowns,Jams,Planned Works Closures,Unknown Causes,Changes,New Incidents",
                "2024-12-18 13:31:55,1,1,30,30,0,0,1,0,0,1,1",
                "2024-12-18 13:31:55,1,1,30,30,0,0,1,0,0,0,0",
            ]
        );
    }
}
