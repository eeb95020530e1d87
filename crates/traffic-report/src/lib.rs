//! Per-cycle CSV statistics and windowed cause/delay summaries.

use thiserror::Error;

mod cycle;
mod summary;

pub use cycle::{CsvReport, CycleStats, REPORT_FILE_NAME};
pub use summary::{IntervalSummary, SummaryWindow, WindowSummary};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("summary window start {start} is after end {end}")]
    InvalidWindow {
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Quotes a CSV field when it contains a delimiter, quote, or line break.
pub(crate) fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

pub(crate) fn csv_row<I, S>(fields: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut row = fields
        .into_iter()
        .map(|field| csv_field(field.as_ref()))
        .collect::<Vec<_>>()
        .join(",");
    row.push('\n');
    row
}

#[cfg(test)]
mod tests {
    use super::{csv_field, csv_row};

    #[test]
    fn unit_csv_field_quotes_only_when_needed() {
        assert_eq!(csv_field("Jams"), "Jams");
        assert_eq!(csv_field("Works, Closures"), "\"Works, Closures\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_row(["a", "b,c"]), "a,\"b,c\"\n");
    }
}
