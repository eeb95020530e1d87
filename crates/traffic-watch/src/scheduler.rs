use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;

/// When cycles run.
#[derive(Debug, Clone)]
pub(crate) enum CycleSchedule {
    /// First cycle immediately, then one every interval.
    Interval(Duration),
    /// Cycles at each cron occurrence evaluated in `timezone`.
    Cron {
        expression: String,
        schedule: Box<Schedule>,
        timezone: Tz,
    },
}

impl CycleSchedule {
    pub(crate) fn interval_minutes(minutes: u64) -> Self {
        Self::Interval(Duration::from_secs(minutes.saturating_mul(60)))
    }

    pub(crate) fn cron(expression: &str, timezone: &str) -> Result<Self> {
        let schedule = Schedule::from_str(expression)
            .with_context(|| format!("invalid cron expression '{}'", expression))?;
        let timezone: Tz = timezone
            .parse()
            .map_err(|_| anyhow!("invalid timezone '{}'", timezone))?;
        Ok(Self::Cron {
            expression: expression.to_string(),
            schedule: Box::new(schedule),
            timezone,
        })
    }

    fn runs_immediately(&self) -> bool {
        matches!(self, Self::Interval(_))
    }

    /// Time to wait after `from` before the next cycle.
    pub(crate) fn delay_after(&self, from: DateTime<Utc>) -> Result<Duration> {
        match self {
            Self::Interval(interval) => Ok(*interval),
            Self::Cron {
                expression,
                schedule,
                timezone,
            } => {
                let local_from = from.with_timezone(timezone);
                let next = schedule.after(&local_from).next().ok_or_else(|| {
                    anyhow!("cron expression '{}' has no future occurrence", expression)
                })?;
                Ok((next.with_timezone(&Utc) - from)
                    .to_std()
                    .unwrap_or(Duration::ZERO))
            }
        }
    }
}

/// Runs `job` on the blocking pool according to `schedule` until Ctrl-C.
///
/// The job state moves onto the worker thread for each run and is handed back
/// when the loop stops, so the caller can release it.
pub(crate) async fn run_scheduled<T, F>(state: T, schedule: &CycleSchedule, job: F) -> Result<T>
where
    T: Send + 'static,
    F: FnMut(&mut T, DateTime<Utc>) + Send + 'static,
{
    let mut slot = Some((state, job));
    if schedule.runs_immediately() {
        slot = Some(run_job(take_slot(&mut slot)?).await?);
    }

    loop {
        let delay = schedule.delay_after(Utc::now())?;
        tracing::debug!(delay_secs = delay.as_secs(), "waiting for next cycle");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested");
                let (state, _) = take_slot(&mut slot)?;
                return Ok(state);
            }
            _ = tokio::time::sleep(delay) => {}
        }
        slot = Some(run_job(take_slot(&mut slot)?).await?);
    }
}

fn take_slot<T, F>(slot: &mut Option<(T, F)>) -> Result<(T, F)> {
    slot.take()
        .ok_or_else(|| anyhow!("scheduled job state was lost"))
}

async fn run_job<T, F>((mut state, mut job): (T, F)) -> Result<(T, F)>
where
    T: Send + 'static,
    F: FnMut(&mut T, DateTime<Utc>) + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        job(&mut state, Utc::now());
        (state, job)
    })
    .await
    .context("cycle worker panicked")
}

#[cfg(test)]
mod tests {
    use super::CycleSchedule;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn unit_interval_delay_is_constant() {
        let schedule = CycleSchedule::interval_minutes(5);
        assert_eq!(
            schedule.delay_after(Utc::now()).expect("delay"),
            Duration::from_secs(300)
        );
    }

    #[test]
    fn functional_cron_delay_respects_timezone() {
        let schedule = CycleSchedule::cron("0 0 8 * * *", "Asia/Singapore").expect("schedule");
        // 23:00 UTC is 07:00 in Singapore, one hour before the 08:00 run.
        let from = Utc.with_ymd_and_hms(2024, 12, 18, 23, 0, 0).unwrap();
        assert_eq!(
            schedule.delay_after(from).expect("delay"),
            Duration::from_secs(3_600)
        );
    }

    #[test]
    fn regression_invalid_cron_or_timezone_is_rejected() {
        assert!(CycleSchedule::cron("every day", "UTC").is_err());
        assert!(CycleSchedule::cron("0 0 8 * * *", "Mars/Olympus").is_err());
    }

    #[tokio::test]
    async fn integration_run_scheduled_runs_first_interval_cycle_immediately() {
        let runs = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&runs);
        let schedule = CycleSchedule::Interval(Duration::from_secs(3_600));
        let run = tokio::time::timeout(
            Duration::from_millis(200),
            super::run_scheduled((), &schedule, move |_: &mut (), _| {
                observed.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await;
        // The loop only returns on Ctrl-C, so the timeout fires while waiting.
        assert!(run.is_err());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
