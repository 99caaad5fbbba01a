use chrono::{DateTime, Days, LocalResult, NaiveDate, NaiveDateTime, TimeZone};

use crate::alarm::model::{DayWindow, Recurrence};

/// Hard stop for a single window, whatever the interval.
pub const MAX_TRIGGERS_PER_WINDOW: usize = 50;
pub const TEST_MODE_TRIGGER_COUNT: usize = 5;

/// Every trigger instant the window opening on `date` produces, ascending.
///
/// Interval recurrences emit instants in `[start, end)`; the test-mode burst
/// keeps instants up to and including `end`. An `end` that does not land
/// after `start` is moved to the following date.
pub fn expand_window<Tz>(
    window: &DayWindow,
    recurrence: &Recurrence,
    date: NaiveDate,
    timezone: &Tz,
) -> Vec<DateTime<Tz>>
where
    Tz: TimeZone,
    Tz::Offset: Copy,
{
    let Some((start, end)) = resolve_window(window, date, timezone) else {
        return Vec::new();
    };

    let step = recurrence.cycle();
    if step <= chrono::Duration::zero() {
        return Vec::new();
    }

    match recurrence {
        Recurrence::TestMode { .. } => (0..TEST_MODE_TRIGGER_COUNT as i32)
            .map(|index| start + step * index)
            .filter(|at| *at <= end)
            .collect(),
        Recurrence::Interval { .. } => {
            let mut triggers = Vec::new();
            let mut at = start;
            while at < end && triggers.len() < MAX_TRIGGERS_PER_WINDOW {
                triggers.push(at);
                at = at + step;
            }
            triggers
        }
    }
}

pub(crate) fn resolve_window<Tz>(
    window: &DayWindow,
    date: NaiveDate,
    timezone: &Tz,
) -> Option<(DateTime<Tz>, DateTime<Tz>)>
where
    Tz: TimeZone,
    Tz::Offset: Copy,
{
    let start = resolve_local_datetime(timezone, date.and_time(window.start))?;
    let same_day_end = resolve_local_datetime(timezone, date.and_time(window.end))?;
    if same_day_end > start {
        return Some((start, same_day_end));
    }
    let next_date = date.checked_add_days(Days::new(1))?;
    let end = resolve_local_datetime(timezone, next_date.and_time(window.end))?;
    Some((start, end))
}

/// Fall-back ambiguity picks the first instance; a spring-forward gap moves
/// the wall time one hour later.
pub(crate) fn resolve_local_datetime<Tz>(timezone: &Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>>
where
    Tz: TimeZone,
    Tz::Offset: Copy,
{
    match timezone.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt),
        LocalResult::Ambiguous(first, _second) => Some(first),
        LocalResult::None => timezone
            .from_local_datetime(&(naive + chrono::Duration::hours(1)))
            .earliest(),
    }
}
