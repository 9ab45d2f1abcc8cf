use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

use crate::models::Schedule;

/// Compute when a schedule is next due, strictly after `reference`.
///
/// Returns `None` for schedules that never trigger on their own (manual) and for
/// schedules that cannot be interpreted; the latter are logged as warnings.
/// The result depends only on the arguments.
pub fn compute_next_run(
    schedule: &Schedule,
    timezone: &str,
    reference: DateTime<Utc>,
    last_run_at: Option<DateTime<Utc>>,
    created_at: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match schedule {
        Schedule::Manual => None,
        Schedule::Daily { time } => {
            let time = parse_time(time)?;
            let tz = resolve_zone(timezone);
            next_daily(tz, time, reference)
        }
        Schedule::Weekly { time, days } => {
            let time = parse_time(time)?;
            let tz = resolve_zone(timezone);
            next_weekly(tz, time, &parse_weekdays(days), reference)
        }
        Schedule::Interval { interval_hours } => {
            next_interval(*interval_hours, reference, last_run_at, created_at)
        }
        Schedule::Unknown => {
            tracing::warn!("Unknown schedule type, subscription will not be scheduled");
            None
        }
    }
}

fn resolve_zone(name: &str) -> Tz {
    name.parse::<Tz>().unwrap_or_else(|_| {
        tracing::warn!("Invalid timezone '{}', falling back to UTC", name);
        Tz::UTC
    })
}

fn parse_time(raw: &str) -> Option<NaiveTime> {
    match NaiveTime::parse_from_str(raw.trim(), "%H:%M") {
        Ok(time) => Some(time),
        Err(e) => {
            tracing::warn!("Invalid schedule time '{}': {}", raw, e);
            None
        }
    }
}

/// Unrecognised names are dropped; an empty result means Monday.
fn parse_weekdays(days: &[String]) -> Vec<Weekday> {
    let mut weekdays: Vec<Weekday> = days
        .iter()
        .filter_map(|day| match day.trim().parse::<Weekday>() {
            Ok(weekday) => Some(weekday),
            Err(_) => {
                tracing::warn!("Ignoring unknown weekday '{}'", day);
                None
            }
        })
        .collect();

    if weekdays.is_empty() {
        weekdays.push(Weekday::Mon);
    }
    weekdays
}

/// Wall-clock `time` on `date` in `tz` as an absolute instant.
///
/// Ambiguous times (clocks going back) take the earlier instant. Times that do
/// not exist (clocks going forward) move forward by the size of the gap.
fn local_instant(tz: Tz, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
    let naive = date.and_time(time);
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => tz
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc)),
    }
}

fn next_daily(tz: Tz, time: NaiveTime, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let today = reference.with_timezone(&tz).date_naive();

    let candidate = local_instant(tz, today, time)?;
    if candidate > reference {
        return Some(candidate);
    }
    local_instant(tz, today.succ_opt()?, time)
}

fn next_weekly(
    tz: Tz,
    time: NaiveTime,
    days: &[Weekday],
    reference: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let today = reference.with_timezone(&tz).date_naive();

    // Today plus a full week always contains a slot after the reference.
    today
        .iter_days()
        .take(8)
        .filter(|date| days.contains(&date.weekday()))
        .filter_map(|date| local_instant(tz, date, time))
        .find(|candidate| *candidate > reference)
}

fn next_interval(
    interval_hours: u32,
    reference: DateTime<Utc>,
    last_run_at: Option<DateTime<Utc>>,
    created_at: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    if interval_hours == 0 {
        tracing::warn!("Interval schedule with zero hours, subscription will not be scheduled");
        return None;
    }

    let interval = Duration::hours(i64::from(interval_hours));
    let base = last_run_at.or(created_at).unwrap_or(reference);

    let next = base + interval;
    if next > reference {
        return Some(next);
    }

    // Jump over every missed slot at once instead of stepping through them.
    let missed = (reference - base).num_seconds() / interval.num_seconds();
    Some(base + interval * i32::try_from(missed + 1).ok()?)
}
