use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use traffic_types::BoundingBox;

pub(crate) const DEFAULT_DB_FILE_NAME: &str = "TrafficIncidents.db";

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

/// One year; longer absences are indistinguishable from never expiring.
const MAX_EXPIRY_THRESHOLD_MINUTES: u64 = 365 * 24 * 60;

fn parse_expiry_minutes(value: &str) -> Result<u64, String> {
    let minutes = parse_positive_u64(value)?;
    if minutes > MAX_EXPIRY_THRESHOLD_MINUTES {
        return Err(format!(
            "value must be at most {MAX_EXPIRY_THRESHOLD_MINUTES} minutes"
        ));
    }
    Ok(minutes)
}

fn parse_bbox(value: &str) -> Result<BoundingBox, String> {
    value.parse::<BoundingBox>().map_err(|error| error.to_string())
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|error| format!("expected an RFC 3339 timestamp: {error}"))
}

#[derive(Debug, Parser)]
#[command(
    name = "traffic-watch",
    about = "Polls traffic incidents for a region and keeps a reconciled incident history",
    version
)]
pub(crate) struct Cli {
    #[arg(
        long = "data-dir",
        env = "TRAFFIC_WATCH_DIR",
        default_value = ".traffic-watch",
        global = true,
        help = "Directory holding the incident database, report.csv, and exports"
    )]
    pub(crate) data_dir: PathBuf,

    #[arg(
        long = "db-path",
        env = "TRAFFIC_WATCH_DB",
        global = true,
        help = "Incident database path; defaults to <data-dir>/TrafficIncidents.db"
    )]
    pub(crate) db_path: Option<PathBuf>,

    #[arg(
        long = "cause-mapping",
        env = "TRAFFIC_WATCH_CAUSE_MAPPING",
        global = true,
        help = "JSON file mapping icon categories to report causes; the built-in table is used when omitted"
    )]
    pub(crate) cause_mapping: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) command: Command,
}

impl Cli {
    pub(crate) fn resolved_db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join(DEFAULT_DB_FILE_NAME))
    }
}

#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Run reconciliation cycles until interrupted
    Poll {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        reconcile: ReconcileArgs,
        #[command(flatten)]
        schedule: ScheduleArgs,
    },
    /// Run a single reconciliation cycle and exit
    Once {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        reconcile: ReconcileArgs,
    },
    /// Write stored incidents active in a window as GeoJSON
    Export {
        #[command(flatten)]
        window: WindowArgs,
        #[arg(long, help = "Output file; defaults to <data-dir>/incidents.geojson")]
        output: Option<PathBuf>,
    },
    /// Write an hourly cause and delay summary of a window as CSV
    Summary {
        #[command(flatten)]
        window: WindowArgs,
        #[arg(long, help = "Output file; defaults to <data-dir>/summary.csv")]
        output: Option<PathBuf>,
    },
    /// Download traffic camera images
    Cameras {
        #[arg(
            long = "camera-api-url",
            env = "TRAFFIC_WATCH_CAMERA_API_URL",
            default_value = traffic_source::camera_images::DEFAULT_CAMERA_API_URL,
            help = "Traffic images listing endpoint"
        )]
        api_url: String,
        #[arg(long = "output-dir", help = "Image directory; defaults to <data-dir>/traffic_images")]
        output_dir: Option<PathBuf>,
        #[arg(
            long = "every-seconds",
            value_parser = parse_positive_u64,
            help = "Repeat the download at this interval until interrupted"
        )]
        every_seconds: Option<u64>,
        #[arg(
            long = "http-timeout-ms",
            default_value_t = 10_000,
            value_parser = parse_positive_u64,
            help = "Per-request HTTP timeout in milliseconds"
        )]
        http_timeout_ms: u64,
    },
}

#[derive(Debug, Clone, Args)]
pub(crate) struct SourceArgs {
    #[arg(
        long = "api-key",
        env = "TOMTOM_API_KEY",
        hide_env_values = true,
        help = "TomTom API key"
    )]
    pub(crate) api_key: Option<String>,

    #[arg(
        long = "tomtom-base-url",
        env = "TOMTOM_BASE_URL",
        default_value = traffic_source::DEFAULT_TOMTOM_BASE_URL,
        help = "Base URL for TomTom APIs"
    )]
    pub(crate) base_url: String,

    #[arg(
        long,
        default_value = "Singapore",
        help = "Place name geocoded to the polling bounding box"
    )]
    pub(crate) location: String,

    #[arg(
        long,
        value_parser = parse_bbox,
        help = "Bounding box as min_lon,min_lat,max_lon,max_lat; skips geocoding"
    )]
    pub(crate) bbox: Option<BoundingBox>,

    #[arg(long, default_value = "en-GB", help = "Language for incident descriptions")]
    pub(crate) language: String,

    #[arg(
        long = "http-timeout-ms",
        default_value_t = 10_000,
        value_parser = parse_positive_u64,
        help = "Per-request HTTP timeout in milliseconds"
    )]
    pub(crate) http_timeout_ms: u64,
}

#[derive(Debug, Clone, Args)]
pub(crate) struct ReconcileArgs {
    #[arg(
        long = "expiry-threshold-minutes",
        default_value_t = 5,
        value_parser = parse_expiry_minutes,
        help = "Minutes an incident may be absent from the feed before it is marked ended"
    )]
    pub(crate) expiry_threshold_minutes: u64,

    #[arg(
        long = "no-report",
        default_value_t = false,
        help = "Skip appending cycle rows to report.csv"
    )]
    pub(crate) no_report: bool,
}

#[derive(Debug, Clone, Args)]
pub(crate) struct ScheduleArgs {
    #[arg(
        long = "interval-minutes",
        default_value_t = 5,
        value_parser = parse_positive_u64,
        help = "Minutes between cycles when no cron expression is given"
    )]
    pub(crate) interval_minutes: u64,

    #[arg(
        long,
        help = "Cron expression (with seconds field) for fixed-time runs, e.g. '0 0 8 * * *'"
    )]
    pub(crate) cron: Option<String>,

    #[arg(
        long,
        default_value = "UTC",
        help = "IANA timezone the cron expression is evaluated in"
    )]
    pub(crate) timezone: String,
}

#[derive(Debug, Clone, Args)]
pub(crate) struct WindowArgs {
    #[arg(
        long,
        value_parser = parse_timestamp,
        help = "Window start (RFC 3339); defaults to the earliest stored start time"
    )]
    pub(crate) start: Option<DateTime<Utc>>,

    #[arg(
        long,
        value_parser = parse_timestamp,
        help = "Window end (RFC 3339); defaults to the latest stored start time"
    )]
    pub(crate) end: Option<DateTime<Utc>>,
}
