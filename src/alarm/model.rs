use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::SchedulerSettings;

pub const ALARM_FILE_VERSION: u32 = 1;
pub const TEST_MODE_DEFAULT_INTERVAL_MINUTES: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AlarmValidationError {
    #[error("alarm name must not be empty")]
    EmptyName,
    #[error("alarm '{0}' must recur at an interval greater than zero minutes")]
    ZeroInterval(String),
    #[error("alarm '{0}' must be active on at least one day")]
    NoActiveDays(String),
    #[error("invalid time '{0}', expected HH:MM")]
    InvalidTime(String),
    #[error("unknown weekday '{0}'")]
    UnknownWeekday(String),
    #[error("unknown sound type '{0}'")]
    UnknownSound(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Alarm {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub recurrence: Recurrence,
    pub window: DayWindow,
    pub active_days: ActiveDays,
    pub sound: SoundType,
    /// Recomputed on every reconciliation; never edited by hand.
    pub next_trigger: Option<DateTime<Utc>>,
    /// Set when the platform reports a delivered notification.
    pub last_triggered: Option<DateTime<Utc>>,
}

impl Alarm {
    pub fn validate(&self) -> Result<(), AlarmValidationError> {
        if self.name.trim().is_empty() {
            return Err(AlarmValidationError::EmptyName);
        }
        if self.recurrence.cycle_minutes() == 0 {
            return Err(AlarmValidationError::ZeroInterval(self.name.clone()));
        }
        if !self.active_days.any() {
            return Err(AlarmValidationError::NoActiveDays(self.name.clone()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recurrence {
    Interval { hours: u32, minutes: u32 },
    /// Rapid manual testing: a short burst of triggers a few minutes apart.
    TestMode { interval_minutes: Option<u32> },
}

impl Recurrence {
    pub fn cycle_minutes(&self) -> u32 {
        match *self {
            Recurrence::Interval { hours, minutes } => {
                hours.saturating_mul(60).saturating_add(minutes)
            }
            Recurrence::TestMode { interval_minutes } => {
                interval_minutes.unwrap_or(TEST_MODE_DEFAULT_INTERVAL_MINUTES)
            }
        }
    }

    pub fn cycle(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.cycle_minutes()))
    }
}

impl fmt::Display for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Recurrence::Interval { hours, minutes } => write!(f, "every {hours}h {minutes}m"),
            Recurrence::TestMode { .. } => {
                write!(f, "test mode every {}m", self.cycle_minutes())
            }
        }
    }
}

/// Daily wall-clock window. An `end` at or before `start` runs past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl DayWindow {
    pub fn parse(start: &str, end: &str) -> Result<Self, AlarmValidationError> {
        Ok(Self {
            start: parse_clock_time(start)?,
            end: parse_clock_time(end)?,
        })
    }

    pub fn is_overnight(&self) -> bool {
        self.end <= self.start
    }
}

impl fmt::Display for DayWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}",
            self.start.format("%H:%M"),
            self.end.format("%H:%M")
        )
    }
}

pub fn parse_clock_time(input: &str) -> Result<NaiveTime, AlarmValidationError> {
    NaiveTime::parse_from_str(input.trim(), "%H:%M")
        .map_err(|_| AlarmValidationError::InvalidTime(input.to_string()))
}

/// Indexed Sunday = 0 through Saturday = 6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActiveDays(pub [bool; 7]);

impl ActiveDays {
    pub const EVERY_DAY: ActiveDays = ActiveDays([true; 7]);

    pub fn contains(&self, day: Weekday) -> bool {
        self.0[day.num_days_from_sunday() as usize]
    }

    pub fn any(&self) -> bool {
        self.0.iter().any(|active| *active)
    }

    pub fn from_weekdays(days: &[Weekday]) -> Self {
        let mut flags = [false; 7];
        for day in days {
            flags[day.num_days_from_sunday() as usize] = true;
        }
        Self(flags)
    }

    /// Accepts a comma separated list of day tokens, or `all`.
    pub fn parse_list(input: &str) -> Result<Self, AlarmValidationError> {
        if input.trim().eq_ignore_ascii_case("all") {
            return Ok(Self::EVERY_DAY);
        }
        let days = input
            .split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(|token| {
                token
                    .parse::<Weekday>()
                    .map_err(|_| AlarmValidationError::UnknownWeekday(token.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_weekdays(&days))
    }
}

impl fmt::Display for ActiveDays {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const LETTERS: [char; 7] = ['S', 'M', 'T', 'W', 'T', 'F', 'S'];
        for (letter, active) in LETTERS.iter().zip(self.0) {
            let shown = if active { *letter } else { '-' };
            write!(f, "{shown}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SoundType {
    #[default]
    Default,
    Chime,
    Bell,
    Gentle,
    Birdsong,
    Silent,
}

const SOUND_RESOURCES: [(SoundType, &str, &str); 6] = [
    (SoundType::Default, "default", "default"),
    (SoundType::Chime, "chime", "chime.wav"),
    (SoundType::Bell, "bell", "bell.wav"),
    (SoundType::Gentle, "gentle", "gentle_rise.wav"),
    (SoundType::Birdsong, "birdsong", "birdsong.wav"),
    (SoundType::Silent, "silent", "silence.wav"),
];

impl SoundType {
    /// Resource identifier handed to the notification platform.
    pub fn platform_resource(self) -> &'static str {
        SOUND_RESOURCES
            .iter()
            .find(|(sound, _, _)| *sound == self)
            .map(|(_, _, resource)| *resource)
            .unwrap_or("default")
    }

    pub fn as_str(self) -> &'static str {
        SOUND_RESOURCES
            .iter()
            .find(|(sound, _, _)| *sound == self)
            .map(|(_, name, _)| *name)
            .unwrap_or("default")
    }
}

impl FromStr for SoundType {
    type Err = AlarmValidationError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        SOUND_RESOURCES
            .iter()
            .find(|(_, name, _)| name.eq_ignore_ascii_case(input.trim()))
            .map(|(sound, _, _)| *sound)
            .ok_or_else(|| AlarmValidationError::UnknownSound(input.to_string()))
    }
}

/// Partial update. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlarmPatch {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub recurrence: Option<Recurrence>,
    pub window: Option<DayWindow>,
    pub active_days: Option<ActiveDays>,
    pub sound: Option<SoundType>,
    pub next_trigger: Option<Option<DateTime<Utc>>>,
    pub last_triggered: Option<Option<DateTime<Utc>>>,
}

impl AlarmPatch {
    pub fn enabled(enabled: bool) -> Self {
        Self {
            enabled: Some(enabled),
            ..Self::default()
        }
    }

    pub fn next_trigger(next: Option<DateTime<Utc>>) -> Self {
        Self {
            next_trigger: Some(next),
            ..Self::default()
        }
    }

    pub fn last_triggered(at: DateTime<Utc>) -> Self {
        Self {
            last_triggered: Some(Some(at)),
            ..Self::default()
        }
    }

    /// Drops the engine-owned fields so a user edit cannot set them.
    pub fn without_derived(self) -> Self {
        Self {
            next_trigger: None,
            last_triggered: None,
            ..self
        }
    }

    pub fn apply(self, alarm: &mut Alarm) {
        if let Some(name) = self.name {
            alarm.name = name;
        }
        if let Some(enabled) = self.enabled {
            alarm.enabled = enabled;
        }
        if let Some(recurrence) = self.recurrence {
            alarm.recurrence = recurrence;
        }
        if let Some(window) = self.window {
            alarm.window = window;
        }
        if let Some(active_days) = self.active_days {
            alarm.active_days = active_days;
        }
        if let Some(sound) = self.sound {
            alarm.sound = sound;
        }
        if let Some(next_trigger) = self.next_trigger {
            alarm.next_trigger = next_trigger;
        }
        if let Some(last_triggered) = self.last_triggered {
            alarm.last_triggered = last_triggered;
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AlarmFileContents {
    pub settings: SchedulerSettings,
    pub alarms: Vec<Alarm>,
}

pub fn parse_alarm_file_text(content: &str) -> Result<AlarmFileContents> {
    let raw = serde_json::from_str::<AlarmFile>(content).map_err(|err| {
        let line = err.line();
        let column = err.column();
        anyhow::anyhow!("invalid JSON at line {line}, column {column}: {err}")
    })?;

    if raw.version != ALARM_FILE_VERSION {
        bail!(
            "unsupported alarm file version {}; expected version {ALARM_FILE_VERSION}",
            raw.version
        );
    }
    raw.settings
        .validate()
        .context("invalid settings block in alarm file")?;

    let mut ids = HashSet::new();
    let mut alarms = Vec::with_capacity(raw.alarms.len());
    for entry in raw.alarms {
        if !ids.insert(entry.id.clone()) {
            bail!("duplicate alarm id found: {}", entry.id);
        }
        let id = entry.id.clone();
        let alarm = entry
            .into_alarm()
            .with_context(|| format!("invalid alarm '{id}'"))?;
        alarms.push(alarm);
    }

    Ok(AlarmFileContents {
        settings: raw.settings,
        alarms,
    })
}

pub fn render_alarm_file(contents: &AlarmFileContents) -> Result<String> {
    let file = AlarmFile {
        version: ALARM_FILE_VERSION,
        settings: contents.settings.clone(),
        alarms: contents.alarms.iter().map(AlarmEntry::from).collect(),
    };
    let text = serde_json::to_string_pretty(&file)?;
    Ok(format!("{text}\n"))
}

#[derive(Debug, Serialize, Deserialize)]
struct AlarmFile {
    version: u32,
    #[serde(default)]
    settings: SchedulerSettings,
    #[serde(default)]
    alarms: Vec<AlarmEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AlarmEntry {
    id: String,
    name: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(flatten)]
    recurrence: RecurrenceEntry,
    day_start_time: String,
    day_end_time: String,
    #[serde(default = "default_active_days")]
    active_days: [bool; 7],
    #[serde(default)]
    sound: SoundType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    next_trigger: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_triggered: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RecurrenceEntry {
    Interval {
        #[serde(default)]
        hours_per_cycle: u32,
        #[serde(default)]
        minutes_per_cycle: u32,
    },
    TestMode {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interval_minutes: Option<u32>,
    },
}

impl AlarmEntry {
    fn into_alarm(self) -> Result<Alarm> {
        let window = DayWindow::parse(&self.day_start_time, &self.day_end_time)?;
        let recurrence = match self.recurrence {
            RecurrenceEntry::Interval {
                hours_per_cycle,
                minutes_per_cycle,
            } => Recurrence::Interval {
                hours: hours_per_cycle,
                minutes: minutes_per_cycle,
            },
            RecurrenceEntry::TestMode { interval_minutes } => {
                Recurrence::TestMode { interval_minutes }
            }
        };
        let alarm = Alarm {
            id: self.id,
            name: self.name,
            enabled: self.enabled,
            recurrence,
            window,
            active_days: ActiveDays(self.active_days),
            sound: self.sound,
            next_trigger: self.next_trigger,
            last_triggered: self.last_triggered,
        };
        alarm.validate()?;
        Ok(alarm)
    }
}

impl From<&Alarm> for AlarmEntry {
    fn from(alarm: &Alarm) -> Self {
        let recurrence = match alarm.recurrence {
            Recurrence::Interval { hours, minutes } => RecurrenceEntry::Interval {
                hours_per_cycle: hours,
                minutes_per_cycle: minutes,
            },
            Recurrence::TestMode { interval_minutes } => {
                RecurrenceEntry::TestMode { interval_minutes }
            }
        };
        Self {
            id: alarm.id.clone(),
            name: alarm.name.clone(),
            enabled: alarm.enabled,
            recurrence,
            day_start_time: alarm.window.start.format("%H:%M").to_string(),
            day_end_time: alarm.window.end.format("%H:%M").to_string(),
            active_days: alarm.active_days.0,
            sound: alarm.sound,
            next_trigger: alarm.next_trigger,
            last_triggered: alarm.last_triggered,
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_active_days() -> [bool; 7] {
    [true; 7]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file() -> &'static str {
        r#"
{
  "version": 1,
  "settings": {
    "batch_size": 3,
    "timezone": "Europe/Berlin"
  },
  "alarms": [
    {
      "id": "mood-daytime",
      "name": "Daytime check-in",
      "kind": "interval",
      "hours_per_cycle": 2,
      "minutes_per_cycle": 30,
      "day_start_time": "09:00",
      "day_end_time": "17:00",
      "active_days": [false, true, true, true, true, true, false],
      "sound": "chime"
    },
    {
      "id": "night-owl",
      "name": "Night shift",
      "enabled": false,
      "kind": "test_mode",
      "interval_minutes": 1,
      "day_start_time": "22:00",
      "day_end_time": "02:00"
    }
  ]
}
"#
    }

    #[test]
    fn parses_valid_alarm_file() {
        let contents = parse_alarm_file_text(sample_file()).expect("valid file");
        assert_eq!(contents.settings.batch_size, 3);
        assert_eq!(contents.settings.timezone, chrono_tz::Europe::Berlin);
        assert_eq!(contents.alarms.len(), 2);

        let daytime = &contents.alarms[0];
        assert!(daytime.enabled);
        assert_eq!(
            daytime.recurrence,
            Recurrence::Interval {
                hours: 2,
                minutes: 30
            }
        );
        assert!(daytime.active_days.contains(Weekday::Mon));
        assert!(!daytime.active_days.contains(Weekday::Sun));
        assert_eq!(daytime.sound, SoundType::Chime);

        let night = &contents.alarms[1];
        assert!(!night.enabled);
        assert!(night.window.is_overnight());
        assert_eq!(night.active_days, ActiveDays::EVERY_DAY);
        assert_eq!(night.recurrence.cycle_minutes(), 1);
    }

    #[test]
    fn rendered_file_parses_back_with_derived_fields() {
        let mut contents = parse_alarm_file_text(sample_file()).expect("valid file");
        let fired = DateTime::parse_from_rfc3339("2023-01-02T09:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc);
        contents.alarms[0].last_triggered = Some(fired);

        let text = render_alarm_file(&contents).expect("render");
        assert!(text.contains("\"kind\": \"test_mode\""));
        let reparsed = parse_alarm_file_text(&text).expect("reparse");
        assert_eq!(reparsed.alarms[0].last_triggered, Some(fired));
        assert_eq!(reparsed.alarms[1].recurrence, contents.alarms[1].recurrence);
    }

    #[test]
    fn rejects_duplicate_ids() {
        let json = r#"
{
  "version": 1,
  "alarms": [
    { "id": "dup", "name": "a", "kind": "interval", "hours_per_cycle": 1,
      "day_start_time": "09:00", "day_end_time": "10:00" },
    { "id": "dup", "name": "b", "kind": "interval", "hours_per_cycle": 1,
      "day_start_time": "09:00", "day_end_time": "10:00" }
  ]
}
"#;
        let err = parse_alarm_file_text(json).expect_err("duplicate ids should fail");
        assert!(err.to_string().contains("duplicate alarm id"));
    }

    #[test]
    fn rejects_zero_interval() {
        let json = r#"
{
  "version": 1,
  "alarms": [
    { "id": "zero", "name": "never", "kind": "interval",
      "day_start_time": "09:00", "day_end_time": "10:00" }
  ]
}
"#;
        let err = parse_alarm_file_text(json).expect_err("zero interval should fail");
        assert!(format!("{err:#}").contains("greater than zero minutes"));
    }

    #[test]
    fn rejects_unknown_sound_at_load() {
        let json = r#"
{
  "version": 1,
  "alarms": [
    { "id": "loud", "name": "loud", "kind": "interval", "hours_per_cycle": 1,
      "day_start_time": "09:00", "day_end_time": "10:00", "sound": "airhorn" }
  ]
}
"#;
        let err = parse_alarm_file_text(json).expect_err("unknown sound should fail");
        assert!(err.to_string().contains("invalid JSON"));
    }

    #[test]
    fn rejects_unsupported_version() {
        let err = parse_alarm_file_text(r#"{ "version": 2, "alarms": [] }"#)
            .expect_err("version 2 should fail");
        assert!(err.to_string().contains("unsupported alarm file version"));
    }

    #[test]
    fn validation_requires_an_active_day() {
        let alarm = Alarm {
            id: "a".to_string(),
            name: "Quiet".to_string(),
            enabled: true,
            recurrence: Recurrence::Interval {
                hours: 1,
                minutes: 0,
            },
            window: DayWindow::parse("09:00", "10:00").expect("window"),
            active_days: ActiveDays::default(),
            sound: SoundType::Default,
            next_trigger: None,
            last_triggered: None,
        };
        assert_eq!(
            alarm.validate(),
            Err(AlarmValidationError::NoActiveDays("Quiet".to_string()))
        );
    }

    #[test]
    fn parses_day_lists_and_sounds() {
        let days = ActiveDays::parse_list("Mon, wed,FRI").expect("days");
        assert_eq!(days.0, [false, true, false, true, false, true, false]);
        assert_eq!(days.to_string(), "-M-W-F-");
        assert!(ActiveDays::parse_list("Funday").is_err());

        assert_eq!("Bell".parse::<SoundType>(), Ok(SoundType::Bell));
        assert_eq!(SoundType::Gentle.platform_resource(), "gentle_rise.wav");
        assert_eq!(
            "airhorn".parse::<SoundType>(),
            Err(AlarmValidationError::UnknownSound("airhorn".to_string()))
        );
    }

    #[test]
    fn rejects_malformed_clock_time() {
        assert!(DayWindow::parse("9am", "17:00").is_err());
        assert!(DayWindow::parse("24:00", "17:00").is_err());
        let window = DayWindow::parse("22:30", "06:15").expect("window");
        assert_eq!(window.to_string(), "22:30-06:15");
    }
}
