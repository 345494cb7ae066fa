//! Periodic and daily task runners.
//!
//! Each runner owns a single named task and never overlaps an invocation
//! with its own next one: the body runs to completion before the next
//! sleep starts. Shutdown is signalled through a watch channel.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// The carrier-local business clock.
pub const BUSINESS_TZ: Tz = chrono_tz::Asia::Dhaka;

/// Run `task` to completion, then sleep `period`, until shutdown.
pub async fn run_every<F, Fut>(
    name: &str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut task: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    info!(task = name, period_secs = period.as_secs(), "Periodic task started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        task().await;

        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = shutdown.changed() => {}
        }
    }

    info!(task = name, "Periodic task stopped");
}

/// Run `task` once per day at `hour:minute` local time in `tz`.
pub async fn run_daily_at<F, Fut>(
    name: &str,
    hour: u32,
    minute: u32,
    tz: Tz,
    mut shutdown: watch::Receiver<bool>,
    mut task: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    info!(task = name, hour = hour, minute = minute, tz = %tz, "Daily task scheduled");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let wait = duration_until_next(Utc::now(), hour, minute, tz);
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.changed() => {
                continue;
            }
        }

        if *shutdown.borrow() {
            break;
        }

        task().await;
    }

    info!(task = name, "Daily task stopped");
}

fn resolve_local(tz: Tz, date: NaiveDate, hour: u32, minute: u32) -> DateTime<Tz> {
    let naive = date
        .and_hms_opt(hour, minute, 0)
        .expect("wall-clock target must be a valid time");
    tz.from_local_datetime(&naive)
        .earliest()
        // A DST gap swallowed the target; fall back to an hour later.
        .unwrap_or_else(|| {
            tz.from_local_datetime(&(naive + chrono::Duration::hours(1)))
                .earliest()
                .expect("time after a DST gap must resolve")
        })
}

/// Time until the next `hour:minute` wall-clock occurrence in `tz`.
pub fn duration_until_next(now: DateTime<Utc>, hour: u32, minute: u32, tz: Tz) -> Duration {
    let local_now = now.with_timezone(&tz);

    let today = local_now.date_naive();
    let mut target = resolve_local(tz, today, hour, minute);
    if target <= local_now {
        let tomorrow = today.succ_opt().expect("calendar does not end today");
        target = resolve_local(tz, tomorrow, hour, minute);
    }

    (target.with_timezone(&Utc) - now)
        .to_std()
        .unwrap_or_default()
}
