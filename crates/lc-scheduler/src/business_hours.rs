//! Business-hour slot computation
//!
//! Rounds a candidate instant forward into the lead's business-hour window in
//! their own timezone, skipping configured weekend days and paused dates, and
//! aligning on the next `window_minutes` boundary. Paused dates and weekends
//! push to the next open day at `start_hour`.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use tracing::warn;

use lc_common::BusinessHours;

/// Upper bound on day advancement; a schedule further out than a year means
/// misconfigured weekend/paused settings.
const MAX_DAY_HOPS: u32 = 370;

/// Next timestamp >= `candidate` inside the lead's business window.
///
/// An unknown timezone falls back to UTC rather than failing the schedule.
pub fn next_business_hour_slot(
    timezone: Option<&str>,
    candidate: DateTime<Utc>,
    hours: &BusinessHours,
    paused_dates: &[NaiveDate],
) -> DateTime<Utc> {
    let tz = resolve_timezone(timezone);
    let mut local = candidate.with_timezone(&tz).naive_local();

    for _ in 0..MAX_DAY_HOPS {
        let date = local.date();

        if is_closed_day(date, hours, paused_dates) {
            local = day_start(date_after(date), hours.start_hour);
            continue;
        }

        if (local.hour() as u32) < hours.start_hour {
            local = day_start(date, hours.start_hour);
        }

        let rounded = round_up_to_window(local, hours.window_minutes);

        // Rounding may have spilled past the window or into the next day.
        if rounded.date() != date || rounded.hour() >= hours.end_hour {
            local = day_start(date_after(date), hours.start_hour);
            continue;
        }

        return localize(&tz, rounded);
    }

    warn!(candidate = %candidate, "No open business-hour slot found within a year; using candidate");
    candidate
}

fn resolve_timezone(timezone: Option<&str>) -> Tz {
    match timezone {
        Some(name) => name.parse().unwrap_or_else(|_| {
            warn!(timezone = %name, "Unknown timezone, falling back to UTC");
            Tz::UTC
        }),
        None => Tz::UTC,
    }
}

fn is_closed_day(date: NaiveDate, hours: &BusinessHours, paused_dates: &[NaiveDate]) -> bool {
    let weekday = date.weekday().num_days_from_monday();
    hours.weekend_days.contains(&weekday) || paused_dates.contains(&date)
}

fn date_after(date: NaiveDate) -> NaiveDate {
    date.succ_opt().unwrap_or(date)
}

fn day_start(date: NaiveDate, start_hour: u32) -> NaiveDateTime {
    let time = NaiveTime::from_hms_opt(start_hour.min(23), 0, 0)
        .unwrap_or_else(|| NaiveTime::from_hms_opt(9, 0, 0).expect("valid time"));
    date.and_time(time)
}

/// Round forward to the next `window_minutes` boundary; an instant already on
/// a boundary is kept.
fn round_up_to_window(at: NaiveDateTime, window_minutes: u32) -> NaiveDateTime {
    let window = window_minutes.max(1) as i64;
    let on_boundary = at.minute() as i64 % window == 0 && at.second() == 0 && at.nanosecond() == 0;
    if on_boundary {
        return at;
    }

    let minute = at.minute() as i64;
    let next = ((minute / window) + 1) * window;
    let base = at
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at);
    base + chrono::Duration::minutes(next)
}

fn localize(tz: &Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    // DST gaps have no local representation; nudge forward an hour.
    let mut attempt = naive;
    for _ in 0..3 {
        match tz.from_local_datetime(&attempt) {
            chrono::LocalResult::Single(dt) => return dt.with_timezone(&Utc),
            chrono::LocalResult::Ambiguous(earliest, _) => return earliest.with_timezone(&Utc),
            chrono::LocalResult::None => attempt += chrono::Duration::hours(1),
        }
    }
    Utc.from_utc_datetime(&naive)
}
