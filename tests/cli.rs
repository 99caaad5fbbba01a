use std::fs;
use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::tempdir;

fn valid_alarm_json() -> &'static str {
    r#"
{
  "version": 1,
  "settings": { "timezone": "Europe/Berlin" },
  "alarms": [
    {
      "id": "mood",
      "name": "Mood check",
      "enabled": true,
      "kind": "interval",
      "hours_per_cycle": 2,
      "minutes_per_cycle": 0,
      "day_start_time": "09:00",
      "day_end_time": "17:00",
      "active_days": [true, true, true, true, true, true, true],
      "sound": "chime"
    },
    {
      "id": "night-owl",
      "name": "Late check",
      "enabled": false,
      "kind": "test_mode",
      "day_start_time": "22:00",
      "day_end_time": "01:00",
      "sound": "gentle"
    }
  ]
}
"#
}

fn command(dir: &Path) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("checkin-scheduler");
    cmd.arg("--alarms")
        .arg(dir.join("alarms.json"))
        .arg("--spool")
        .arg(dir.join("notifications.json"));
    cmd
}

#[test]
fn list_shows_alarms_from_file() {
    let dir = tempdir().expect("tempdir");
    fs::write(dir.path().join("alarms.json"), valid_alarm_json()).expect("write json");

    command(dir.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("Mood check"))
        .stdout(predicate::str::contains("09:00-17:00"))
        .stdout(predicate::str::contains("Not scheduled"));
}

#[test]
fn added_alarm_is_scheduled_on_the_spool() {
    let dir = tempdir().expect("tempdir");

    command(dir.path())
        .args(["add", "Hydrate", "08:00", "20:00", "--every-hours", "1"])
        .args(["--id", "hydrate", "--sound", "bell"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hydrate"));

    let spool = fs::read_to_string(dir.path().join("notifications.json")).expect("spool");
    assert_eq!(spool.matches("\"alarm_id\": \"hydrate\"").count(), 5);
    assert!(spool.contains("bell.wav"));

    command(dir.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("Hydrate"))
        .stdout(predicate::str::contains("next: In "));
}

#[test]
fn readding_an_alarm_replaces_its_batch() {
    let dir = tempdir().expect("tempdir");
    for _ in 0..2 {
        command(dir.path())
            .args(["add", "Hydrate", "08:00", "20:00", "--every-minutes", "45"])
            .args(["--id", "hydrate"])
            .assert()
            .success();
    }
    let spool = fs::read_to_string(dir.path().join("notifications.json")).expect("spool");
    assert_eq!(spool.matches("\"alarm_id\": \"hydrate\"").count(), 5);
}

#[test]
fn disable_clears_pending_notifications() {
    let dir = tempdir().expect("tempdir");
    command(dir.path())
        .args(["add", "Stretch", "00:00", "00:00", "--every-hours", "3"])
        .args(["--id", "stretch"])
        .assert()
        .success();
    command(dir.path()).args(["disable", "stretch"]).assert().success();

    let spool = fs::read_to_string(dir.path().join("notifications.json")).expect("spool");
    assert!(!spool.contains("stretch"));
    command(dir.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("Not scheduled"));
}

#[test]
fn diagnostics_reports_platform_counts() {
    let dir = tempdir().expect("tempdir");
    fs::write(dir.path().join("alarms.json"), valid_alarm_json()).expect("write json");

    command(dir.path())
        .args(["diagnostics", "--refresh"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Platform: spool-file"))
        .stdout(predicate::str::contains("Mood check (mood)"))
        .stdout(predicate::str::contains("tracked 5 / platform 5"));
}

#[test]
fn malformed_json_fails_with_clear_error() {
    let dir = tempdir().expect("tempdir");
    fs::write(dir.path().join("alarms.json"), "{ not-valid-json ").expect("write invalid json");

    command(dir.path())
        .arg("list")
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid JSON"));
}

#[test]
fn unknown_sound_is_rejected() {
    let dir = tempdir().expect("tempdir");
    command(dir.path())
        .args(["add", "Noisy", "09:00", "10:00", "--every-hours", "1"])
        .args(["--sound", "foghorn"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown sound type 'foghorn'"));
}

#[test]
fn zero_interval_is_rejected() {
    let dir = tempdir().expect("tempdir");
    command(dir.path())
        .args(["add", "Never", "09:00", "10:00"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("greater than zero minutes"));
    assert!(!dir.path().join("alarms.json").exists());
}

#[test]
fn unknown_timezone_is_rejected() {
    let dir = tempdir().expect("tempdir");
    command(dir.path())
        .args(["--timezone", "Mars/Olympus", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown timezone"));
}
