use chrono::{DateTime, Utc};

use crate::alarm::model::Alarm;

pub const NOT_SCHEDULED: &str = "Not scheduled";
pub const OVERDUE: &str = "Overdue";

/// Human-readable countdown to the alarm's next trigger.
pub fn format_next_trigger(alarm: &Alarm, now: DateTime<Utc>) -> String {
    let next = if alarm.enabled { alarm.next_trigger } else { None };
    format_countdown(next, now)
}

pub fn format_countdown(next: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(next) = next else {
        return NOT_SCHEDULED.to_string();
    };
    if next <= now {
        return OVERDUE.to_string();
    }

    let remaining = next - now;
    let days = remaining.num_days();
    if days >= 1 {
        let unit = if days == 1 { "day" } else { "days" };
        return format!("In {days} {unit}");
    }

    if remaining < chrono::Duration::minutes(1) {
        return "In <1m".to_string();
    }

    let hours = remaining.num_hours();
    let minutes = remaining.num_minutes() % 60;
    if hours >= 1 {
        format!("In {hours}h {minutes}m")
    } else {
        format!("In {minutes}m")
    }
}

/// Wall-clock rendering used by listings, e.g. `Mon 2023-01-02 09:00`.
pub fn format_local_instant<Tz>(at: DateTime<Utc>, timezone: &Tz) -> String
where
    Tz: chrono::TimeZone,
    Tz::Offset: std::fmt::Display,
{
    at.with_timezone(timezone)
        .format("%a %Y-%m-%d %H:%M")
        .to_string()
}
