use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use traffic_report::{CsvReport, SummaryWindow, WindowSummary};
use traffic_source::{CameraImageClient, TomTomIncidentClient};
use traffic_store::{export_geojson, IncidentStore, SqliteIncidentStore};
use traffic_types::CauseMapping;

use crate::bootstrap::{
    build_incident_client, load_cause_mapping, open_store, resolve_bounding_box,
};
use crate::cli::{Cli, Command, ReconcileArgs, ScheduleArgs, SourceArgs, WindowArgs};
use crate::driver::{CycleDriver, CycleOutcome};
use crate::scheduler::{run_scheduled, CycleSchedule};

type WatchDriver = CycleDriver<TomTomIncidentClient, SqliteIncidentStore>;

pub(crate) async fn run_cli(cli: Cli) -> Result<()> {
    let mapping = load_cause_mapping(cli.cause_mapping.as_deref())?;
    let db_path = cli.resolved_db_path();
    let data_dir = cli.data_dir;

    match cli.command {
        Command::Poll {
            source,
            reconcile,
            schedule,
        } => {
            let schedule = build_schedule(&schedule)?;
            let driver = on_blocking_pool(move || {
                build_driver(&data_dir, &db_path, &source, &reconcile, mapping)
            })
            .await?;
            tracing::info!(?schedule, "starting incident polling");
            let driver = run_scheduled(driver, &schedule, |driver: &mut WatchDriver, now| {
                log_outcome(&driver.run_cycle(now));
            })
            .await?;
            on_blocking_pool(move || shutdown_driver(driver)).await
        }
        Command::Once { source, reconcile } => {
            on_blocking_pool(move || {
                let mut driver = build_driver(&data_dir, &db_path, &source, &reconcile, mapping)?;
                let outcome = driver.run_cycle(Utc::now());
                log_outcome(&outcome);
                shutdown_driver(driver)?;
                if let CycleOutcome::Skipped { reason } = outcome {
                    bail!("cycle skipped: {reason}");
                }
                Ok(())
            })
            .await
        }
        Command::Export { window, output } => {
            let output = output.unwrap_or_else(|| data_dir.join("incidents.geojson"));
            on_blocking_pool(move || export_command(&db_path, &window, &output)).await
        }
        Command::Summary { window, output } => {
            let output = output.unwrap_or_else(|| data_dir.join("summary.csv"));
            on_blocking_pool(move || summary_command(&db_path, &window, &output, &mapping)).await
        }
        Command::Cameras {
            api_url,
            output_dir,
            every_seconds,
            http_timeout_ms,
        } => {
            let output_dir = output_dir.unwrap_or_else(|| data_dir.join("traffic_images"));
            let client = on_blocking_pool(move || {
                CameraImageClient::new(api_url, Duration::from_millis(http_timeout_ms))
                    .context("failed to build camera http client")
            })
            .await?;
            let job = move |client: &mut CameraImageClient, now: DateTime<Utc>| {
                if let Err(error) = client.download_all(now, &output_dir) {
                    tracing::error!(%error, "camera image download failed");
                }
            };
            let client = match every_seconds {
                Some(seconds) => {
                    let schedule = CycleSchedule::Interval(Duration::from_secs(seconds));
                    run_scheduled(client, &schedule, job).await?
                }
                None => {
                    on_blocking_pool(move || {
                        let mut client = client;
                        let mut job = job;
                        job(&mut client, Utc::now());
                        Ok(client)
                    })
                    .await?
                }
            };
            on_blocking_pool(move || {
                drop(client);
                Ok(())
            })
            .await
        }
    }
}

/// Blocking HTTP clients must be built, used, and dropped off the async
/// executor threads.
async fn on_blocking_pool<T, F>(task: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .context("blocking worker panicked")?
}

fn build_schedule(args: &ScheduleArgs) -> Result<CycleSchedule> {
    match args.cron.as_deref() {
        Some(expression) => CycleSchedule::cron(expression, &args.timezone),
        None => Ok(CycleSchedule::interval_minutes(args.interval_minutes)),
    }
}

fn build_driver(
    data_dir: &Path,
    db_path: &Path,
    source: &SourceArgs,
    reconcile: &ReconcileArgs,
    mapping: CauseMapping,
) -> Result<WatchDriver> {
    let client = build_incident_client(source)?;
    let bbox = resolve_bounding_box(source)?;
    let store = open_store(db_path)?;
    let report = if reconcile.no_report {
        None
    } else {
        Some(
            CsvReport::open(data_dir, &mapping)
                .with_context(|| format!("failed to open cycle report in {}", data_dir.display()))?,
        )
    };
    tracing::info!(bbox = %bbox, db_path = %db_path.display(), "incident watch ready");
    Ok(CycleDriver::new(
        client,
        store,
        bbox,
        mapping,
        report,
        Duration::from_secs(reconcile.expiry_threshold_minutes.saturating_mul(60)),
    ))
}

fn shutdown_driver(driver: WatchDriver) -> Result<()> {
    let store = driver.into_store();
    if let Err(error) = store.optimize() {
        tracing::warn!(%error, "failed to optimize incident store on shutdown");
    }
    store.close().context("failed to close incident store")
}

fn log_outcome(outcome: &CycleOutcome) {
    match outcome {
        CycleOutcome::Skipped { reason } => {
            tracing::warn!(%reason, "cycle skipped");
        }
        CycleOutcome::Reconciled(summary) => {
            tracing::info!(
                current = summary.totals.seen,
                changed = summary.totals.changed,
                inserted = summary.totals.inserted,
                skipped = summary.totals.skipped,
                failed = summary.totals.failed,
                expired = summary.expired,
                corrupt_skipped = summary.corrupt_skipped,
                total_delay = summary.stats.total_delay,
                report_written = summary.report_written,
                "cycle complete"
            );
        }
    }
}

/// Explicit bounds win; missing ones fall back to the stored start-time range.
fn resolve_window<S: IncidentStore + ?Sized>(
    store: &S,
    window: &WindowArgs,
) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
    let (start, end) = match (window.start, window.end) {
        (Some(start), Some(end)) => (Some(start), Some(end)),
        (start, end) => {
            let bounds = store
                .start_time_bounds()
                .context("failed to read stored start time range")?;
            (start.or(bounds.earliest), end.or(bounds.latest))
        }
    };
    match (start, end) {
        (Some(start), Some(end)) if start > end => {
            bail!("window start {start} is after window end {end}")
        }
        (Some(start), Some(end)) => Ok(Some((start, end))),
        _ => Ok(None),
    }
}

fn export_command(db_path: &Path, window: &WindowArgs, output: &Path) -> Result<()> {
    let store = open_store(db_path)?;
    let Some((start, end)) = resolve_window(&store, window)? else {
        println!("no incidents stored in {}; nothing to export", db_path.display());
        return store.close().context("failed to close incident store");
    };

    let mut buffer = Vec::new();
    let summary = export_geojson(&store, start, end, &mut buffer)
        .with_context(|| format!("failed to export incidents from {}", db_path.display()))?;
    write_output_atomic(output, &buffer)?;
    println!(
        "exported {} incident(s) to {} (skipped {} unreadable)",
        summary.exported,
        output.display(),
        summary.skipped
    );
    store.close().context("failed to close incident store")
}

fn summary_command(
    db_path: &Path,
    window: &WindowArgs,
    output: &Path,
    mapping: &CauseMapping,
) -> Result<()> {
    let store = open_store(db_path)?;
    let Some((start, end)) = resolve_window(&store, window)? else {
        println!("no incidents stored in {}; nothing to summarize", db_path.display());
        return store.close().context("failed to close incident store");
    };

    let incidents = store
        .incidents_in_window(start, end)
        .context("failed to read incident window")?;
    for corrupt in &incidents.corrupt {
        tracing::warn!(incident_id = %corrupt.id, reason = %corrupt.reason, "skipping unreadable incident in summary");
    }
    let summary = WindowSummary::build(
        &incidents.incidents,
        mapping,
        SummaryWindow::new(start, end)?,
        Utc::now(),
    );
    let mut buffer = Vec::new();
    summary.write_csv(&mut buffer)?;
    write_output_atomic(output, &buffer)?;
    println!(
        "summarized {} incident(s) over {} interval(s) to {}",
        summary.total_incidents(),
        summary.intervals.len(),
        output.display()
    );
    store.close().context("failed to close incident store")
}

/// Writes through a sibling temp file so readers never see a partial export.
fn write_output_atomic(path: &Path, content: &[u8]) -> Result<()> {
    if path.as_os_str().is_empty() {
        bail!("destination path cannot be empty");
    }
    if path.is_dir() {
        bail!("destination path '{}' is a directory", path.display());
    }
    let parent_dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent_dir)
        .with_context(|| format!("failed to create {}", parent_dir.display()))?;

    let temp_path: PathBuf = parent_dir.join(format!(
        ".{}.tmp-{}",
        path.file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("export"),
        std::process::id()
    ));
    std::fs::write(&temp_path, content)
        .with_context(|| format!("failed to write temporary file {}", temp_path.display()))?;
    std::fs::rename(&temp_path, path).with_context(|| {
        format!(
            "failed to rename temporary file {} to {}",
            temp_path.display(),
            path.display()
        )
    })
}
