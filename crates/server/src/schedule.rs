use chrono::{Datelike, NaiveDateTime, Timelike, Utc};
use common::config::Badges;
use common::db::AsyncDb;
use common::types::MonthYear;

use crate::rankings;

/// The next first-of-month run boundary at `run_hour` UTC, strictly after
/// pre-boundary moments on the 1st itself.
pub fn next_run(now: NaiveDateTime, run_hour: u32) -> NaiveDateTime {
    // Out-of-range config values degrade to 23:00 instead of panicking.
    let run_hour = run_hour.min(23);
    if now.day() == 1 && now.hour() < run_hour {
        return now
            .date()
            .and_hms_opt(run_hour, 0, 0)
            .expect("hour clamped to 0..=23");
    }
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    chrono::NaiveDate::from_ymd_opt(year, month, 1)
        .expect("first of month exists")
        .and_hms_opt(run_hour, 0, 0)
        .expect("valid run hour")
}

/// Self-rescheduling badge loop.
///
/// On start, if today is the first of the month, the previous month is
/// processed immediately (catches a restart that missed the boundary).
/// After that the task sleeps to each first-of-month boundary and runs the
/// job for the month that just closed. A failed run is logged and counted;
/// the loop still schedules the next cycle. No schedule state is persisted:
/// a restart re-derives the same target.
pub async fn run_scheduler(db: AsyncDb, badges: Badges) {
    let now = Utc::now().naive_utc();
    if now.day() == 1 {
        let month = MonthYear::preceding(now.date());
        tracing::info!(%month, "first of month at startup, running badge assignment");
        // Failure is recoverable: logged in run_for_month, next cycle unaffected.
        let _ = rankings::run_for_month(&db, month, badges.min_monthly_predictions).await;
    }

    loop {
        let now = Utc::now().naive_utc();
        let target = next_run(now, badges.run_hour);
        let wait = (target - now)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        tracing::info!(next_run = %target, "badge scheduler sleeping until month boundary");
        tokio::time::sleep(wait).await;

        let month = MonthYear::preceding(Utc::now().naive_utc().date());
        let _ = rankings::run_for_month(&db, month, badges.min_monthly_predictions).await;
    }
}
