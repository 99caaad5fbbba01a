use chrono::{DateTime, Datelike, Days, NaiveDate, TimeZone};

use crate::alarm::model::Alarm;
use crate::alarm::window::expand_window;

/// How far ahead to look and how close to "now" a trigger may be.
#[derive(Debug, Clone, Copy)]
pub struct ScanLimits {
    pub days: u32,
    pub buffer: chrono::Duration,
}

impl ScanLimits {
    pub fn new(days: u32, buffer: chrono::Duration) -> Self {
        Self { days, buffer }
    }
}

/// Next trigger strictly after `now + buffer`, at most `days` days out.
///
/// `None` means the alarm is disabled or idle for the whole horizon. That is
/// a normal outcome and should be shown to the user, not retried.
pub fn next_trigger<Tz>(alarm: &Alarm, now: &DateTime<Tz>, limits: ScanLimits) -> Option<DateTime<Tz>>
where
    Tz: TimeZone,
    Tz::Offset: Copy,
{
    if !alarm.enabled {
        return None;
    }
    for date in scan_dates(alarm, now.date_naive(), limits.days) {
        let mut triggers = day_triggers(alarm, date, now, limits);
        triggers.sort();
        if let Some(first) = triggers.into_iter().next() {
            return Some(first);
        }
    }
    None
}

/// All qualifying triggers across the horizon, ascending and capped at `max`.
pub fn upcoming_triggers<Tz>(
    alarm: &Alarm,
    now: &DateTime<Tz>,
    limits: ScanLimits,
    max: usize,
) -> Vec<DateTime<Tz>>
where
    Tz: TimeZone,
    Tz::Offset: Copy,
{
    if !alarm.enabled || max == 0 {
        return Vec::new();
    }
    let mut triggers = scan_dates(alarm, now.date_naive(), limits.days)
        .into_iter()
        .flat_map(|date| day_triggers(alarm, date, now, limits))
        .collect::<Vec<_>>();
    triggers.sort();
    triggers.dedup();
    triggers.truncate(max);
    triggers
}

/// Dates whose window may still hold a trigger: today onward, plus yesterday
/// when its window runs past midnight into today.
fn scan_dates(alarm: &Alarm, today: NaiveDate, days: u32) -> Vec<NaiveDate> {
    let yesterday = alarm
        .window
        .is_overnight()
        .then(|| today.checked_sub_days(Days::new(1)))
        .flatten();
    let forward = (0..u64::from(days)).filter_map(|offset| today.checked_add_days(Days::new(offset)));
    yesterday
        .into_iter()
        .chain(forward)
        .filter(|date| alarm.active_days.contains(date.weekday()))
        .collect()
}

fn day_triggers<Tz>(
    alarm: &Alarm,
    date: NaiveDate,
    now: &DateTime<Tz>,
    limits: ScanLimits,
) -> Vec<DateTime<Tz>>
where
    Tz: TimeZone,
    Tz::Offset: Copy,
{
    let earliest = *now + limits.buffer;
    let latest = *now + chrono::Duration::days(i64::from(limits.days));
    expand_window(&alarm.window, &alarm.recurrence, date, &now.timezone())
        .into_iter()
        .filter(|at| *at > earliest && *at <= latest)
        .collect()
}
