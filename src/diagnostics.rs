use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::alarm::format::{format_countdown, format_local_instant};

#[derive(Debug, Clone, PartialEq)]
pub struct AlarmDiagnostics {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub tracked_handles: usize,
    /// `None` when the platform could not be listed.
    pub platform_scheduled: Option<usize>,
    pub next_trigger: Option<DateTime<Utc>>,
    pub last_triggered: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl AlarmDiagnostics {
    /// Tracked handles disagree with what the platform lists for this alarm.
    pub fn is_drifted(&self) -> bool {
        self.platform_scheduled
            .is_some_and(|listed| listed != self.tracked_handles)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticsReport {
    pub platform: String,
    pub platform_total: Option<usize>,
    pub store_available: bool,
    /// Platform entries whose alarm no longer exists.
    pub orphaned: usize,
    pub alarms: Vec<AlarmDiagnostics>,
}

impl DiagnosticsReport {
    pub fn drifted(&self) -> impl Iterator<Item = &AlarmDiagnostics> {
        self.alarms.iter().filter(|entry| entry.is_drifted())
    }
}

pub fn print_report(report: &DiagnosticsReport, now: DateTime<Utc>, timezone: &Tz) {
    println!("Check-in scheduler diagnostics");
    println!("Platform: {}", report.platform);
    match report.platform_total {
        Some(total) => println!("Platform pending notifications: {total}"),
        None => println!("Platform pending notifications: unavailable"),
    }
    if !report.store_available {
        println!("Alarm store: unavailable");
    }
    println!("Orphaned notifications: {}", report.orphaned);
    println!("Drifted alarms: {}", report.drifted().count());
    println!("Alarms: {}", report.alarms.len());

    for entry in &report.alarms {
        let state = if entry.enabled { "enabled" } else { "disabled" };
        println!("  {} ({}) [{state}]", entry.name, entry.id);
        let listed = entry
            .platform_scheduled
            .map_or_else(|| "?".to_string(), |count| count.to_string());
        let marker = if entry.is_drifted() { "  DRIFT" } else { "" };
        println!(
            "    handles: tracked {} / platform {listed}{marker}",
            entry.tracked_handles
        );
        match entry.next_trigger {
            Some(next) => println!(
                "    next: {} ({})",
                format_local_instant(next, timezone),
                format_countdown(Some(next), now)
            ),
            None => println!("    next: none"),
        }
        if let Some(last) = entry.last_triggered {
            println!("    last fired: {}", format_local_instant(last, timezone));
        }
        if let Some(message) = entry.last_error.as_deref() {
            println!("    last error: {message}");
        }
    }
}
