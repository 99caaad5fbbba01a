mod alarm;
mod clock;
mod config;
mod diagnostics;
mod platform;
mod store;
#[cfg(test)]
mod test_support;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono_tz::Tz;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::alarm::format::format_local_instant;
use crate::alarm::model::{
    ActiveDays, Alarm, AlarmPatch, DayWindow, Recurrence, SoundType, parse_clock_time,
};
use crate::alarm::scheduler::{AlarmScheduler, FireOutcome, ReconcileOutcome};
use crate::clock::SystemClock;
use crate::platform::{DEFAULT_SPOOL_CAPACITY, SpoolPlatform};
use crate::store::JsonFileStore;

const HORIZON_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(
    name = "checkin-scheduler",
    version,
    about = "Recurring check-in reminders inside daily time windows"
)]
struct Cli {
    /// Versioned alarm file holding the alarms and scheduler settings.
    #[arg(long, env = "CHECKIN_ALARMS", default_value = "alarms.json")]
    alarms: PathBuf,

    /// Spool file standing in for the OS notification schedule.
    #[arg(long, env = "CHECKIN_SPOOL", default_value = "notifications.json")]
    spool: PathBuf,

    /// IANA zone for alarm windows; overrides the alarm file setting.
    #[arg(long, env = "CHECKIN_TIMEZONE")]
    timezone: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show every alarm and its next trigger.
    List,
    Add(AddArgs),
    Edit(EditArgs),
    Delete { id: String },
    Enable { id: String },
    Disable { id: String },
    /// Report a delivered notification and roll the alarm forward.
    Fire { id: String },
    /// Cancel everything on the platform and rebuild every enabled alarm.
    Refresh,
    Diagnostics {
        /// Rebuild the schedule first so tracked handles are populated.
        #[arg(long)]
        refresh: bool,
    },
    /// Delete every alarm and pending notification.
    Clear,
    /// Deliver due notifications until interrupted.
    Run {
        #[arg(long, default_value_t = 1_000)]
        poll_ms: u64,
    },
}

#[derive(Args, Debug)]
struct AddArgs {
    name: String,
    /// Window start, HH:MM.
    start: String,
    /// Window end, HH:MM. At or before the start runs past midnight.
    end: String,
    #[arg(long)]
    id: Option<String>,
    #[arg(long, conflicts_with = "test_mode")]
    every_hours: Option<u32>,
    #[arg(long, conflicts_with = "test_mode")]
    every_minutes: Option<u32>,
    /// Short burst of triggers N minutes apart (default 5).
    #[arg(long, num_args = 0..=1, value_name = "MINUTES")]
    test_mode: Option<Option<u32>>,
    /// Comma separated weekdays (Mon,Wed) or `all`.
    #[arg(long, default_value = "all")]
    days: String,
    #[arg(long, default_value = "default")]
    sound: String,
    #[arg(long)]
    disabled: bool,
}

#[derive(Args, Debug)]
struct EditArgs {
    id: String,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    start: Option<String>,
    #[arg(long)]
    end: Option<String>,
    #[arg(long)]
    every_hours: Option<u32>,
    #[arg(long)]
    every_minutes: Option<u32>,
    #[arg(long)]
    days: Option<String>,
    #[arg(long)]
    sound: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    if let Err(err) = run(Cli::parse()).await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let store = Arc::new(JsonFileStore::new(&cli.alarms));
    let mut settings = store
        .load_settings()
        .await
        .with_context(|| format!("failed to load {}", cli.alarms.display()))?;
    if let Some(zone) = cli.timezone.as_deref() {
        settings.timezone = zone
            .parse::<Tz>()
            .map_err(|err| anyhow!("unknown timezone '{zone}': {err}"))?;
    }
    settings.validate()?;

    let spool = Arc::new(
        SpoolPlatform::open(&cli.spool, DEFAULT_SPOOL_CAPACITY)
            .await
            .with_context(|| format!("failed to open spool {}", cli.spool.display()))?,
    );
    let clock = Arc::new(SystemClock::new(settings.timezone));
    let scheduler = AlarmScheduler::new(store.clone(), spool.clone(), clock, settings);

    match cli.command {
        Command::List => list_alarms(&scheduler).await,
        Command::Add(args) => {
            let alarm = alarm_from_args(args)?;
            alarm
                .validate()
                .with_context(|| format!("invalid alarm '{}'", alarm.name))?;
            let id = scheduler
                .save_alarm(alarm)
                .await
                .ok_or_else(|| anyhow!("failed to save alarm to {}", store.path().display()))?;
            println!("{id}");
        }
        Command::Edit(args) => {
            let id = args.id.clone();
            let patch = patch_from_args(&scheduler, args).await?;
            if !scheduler.update_alarm(&id, patch).await {
                bail!("failed to update alarm '{id}'");
            }
        }
        Command::Delete { id } => {
            if !scheduler.delete_alarm(&id).await {
                bail!("failed to delete alarm '{id}'");
            }
        }
        Command::Enable { id } => {
            if !scheduler.toggle_alarm(&id, true).await {
                bail!("failed to enable alarm '{id}'");
            }
        }
        Command::Disable { id } => {
            if !scheduler.toggle_alarm(&id, false).await {
                bail!("failed to disable alarm '{id}'");
            }
        }
        Command::Fire { id } => match scheduler.on_fired(&id).await {
            FireOutcome::Rescheduled(outcome) => println!("{}", describe_outcome(&outcome)),
            FireOutcome::UnknownAlarm => bail!("unknown alarm '{id}'"),
            FireOutcome::RescheduleFailed => bail!("alarm '{id}' could not be rescheduled"),
        },
        Command::Refresh => {
            let report = scheduler.refresh_all().await;
            if report.store_failed {
                bail!("failed to read {}", store.path().display());
            }
            println!(
                "Reconciled {} alarms ({} notifications, {} idle, {} disabled, {} failed)",
                report.reconciled, report.scheduled, report.idle, report.disabled, report.failed
            );
            if report.runaway {
                println!("Runaway schedule detected; platform cleared");
            }
        }
        Command::Diagnostics { refresh } => {
            if refresh {
                scheduler.refresh_all().await;
            }
            let report = scheduler.diagnostics().await;
            diagnostics::print_report(&report, scheduler.now_utc(), &scheduler.timezone());
        }
        Command::Clear => {
            if !scheduler.clear_all().await {
                bail!("failed to clear {}", store.path().display());
            }
        }
        Command::Run { poll_ms } => {
            if poll_ms == 0 {
                bail!("--poll-ms must be greater than zero");
            }
            deliver_until_interrupted(&scheduler, &spool, Duration::from_millis(poll_ms)).await;
        }
    }
    Ok(())
}

async fn list_alarms(scheduler: &AlarmScheduler) {
    let alarms = scheduler.get_alarms().await;
    if alarms.is_empty() {
        println!("No alarms");
        return;
    }
    for alarm in &alarms {
        let state = if alarm.enabled { "on " } else { "off" };
        println!(
            "{state} {}  {}  {} {}  {}  {}  next: {}",
            alarm.id,
            alarm.name,
            alarm.window,
            alarm.recurrence,
            alarm.active_days,
            alarm.sound.as_str(),
            scheduler.format_next_trigger(alarm)
        );
    }
}

fn alarm_from_args(args: AddArgs) -> Result<Alarm> {
    let recurrence = match args.test_mode {
        Some(interval_minutes) => Recurrence::TestMode { interval_minutes },
        None => Recurrence::Interval {
            hours: args.every_hours.unwrap_or(0),
            minutes: args.every_minutes.unwrap_or(0),
        },
    };
    Ok(Alarm {
        id: args.id.unwrap_or_default(),
        name: args.name,
        enabled: !args.disabled,
        recurrence,
        window: DayWindow::parse(&args.start, &args.end)?,
        active_days: ActiveDays::parse_list(&args.days)?,
        sound: args.sound.parse::<SoundType>()?,
        next_trigger: None,
        last_triggered: None,
    })
}

async fn patch_from_args(scheduler: &AlarmScheduler, args: EditArgs) -> Result<AlarmPatch> {
    let mut patch = AlarmPatch {
        name: args.name,
        ..AlarmPatch::default()
    };
    if let Some(days) = args.days.as_deref() {
        patch.active_days = Some(ActiveDays::parse_list(days)?);
    }
    if let Some(sound) = args.sound.as_deref() {
        patch.sound = Some(sound.parse::<SoundType>()?);
    }

    let touches_window = args.start.is_some() || args.end.is_some();
    let touches_interval = args.every_hours.is_some() || args.every_minutes.is_some();
    if touches_window || touches_interval {
        let current = scheduler
            .get_alarms()
            .await
            .into_iter()
            .find(|alarm| alarm.id == args.id)
            .ok_or_else(|| anyhow!("unknown alarm '{}'", args.id))?;
        if touches_window {
            let mut window = current.window;
            if let Some(start) = args.start.as_deref() {
                window.start = parse_clock_time(start)?;
            }
            if let Some(end) = args.end.as_deref() {
                window.end = parse_clock_time(end)?;
            }
            patch.window = Some(window);
        }
        if touches_interval {
            let (hours, minutes) = match current.recurrence {
                Recurrence::Interval { hours, minutes } => (hours, minutes),
                Recurrence::TestMode { .. } => (0, 0),
            };
            patch.recurrence = Some(Recurrence::Interval {
                hours: args.every_hours.unwrap_or(hours),
                minutes: args.every_minutes.unwrap_or(minutes),
            });
        }
    }
    Ok(patch)
}

fn describe_outcome(outcome: &ReconcileOutcome) -> String {
    match outcome {
        ReconcileOutcome::Scheduled {
            scheduled,
            failed,
            next_trigger,
        } => format!("Scheduled {scheduled} notifications ({failed} failed), next at {next_trigger}"),
        ReconcileOutcome::Idle => "No trigger inside the scan horizon".to_string(),
        ReconcileOutcome::Unscheduled => "Alarm is disabled".to_string(),
        ReconcileOutcome::Missing => "Alarm no longer exists".to_string(),
        ReconcileOutcome::Deferred => "Reconciliation already running".to_string(),
    }
}

async fn deliver_until_interrupted(
    scheduler: &AlarmScheduler,
    spool: &SpoolPlatform,
    poll: Duration,
) {
    let report = scheduler.refresh_all().await;
    info!(scheduled = report.scheduled, "delivery loop started");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(poll);
    let mut horizon_sweep = tokio::time::interval(HORIZON_SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("interrupted; stopping delivery loop");
                return;
            }
            _ = horizon_sweep.tick() => {
                let reconciled = scheduler.reconcile_entering_horizon().await;
                if reconciled > 0 {
                    info!(reconciled, "scheduled alarms that entered the batch horizon");
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        let due = match spool.take_due(scheduler.now_utc()).await {
            Ok(due) => due,
            Err(err) => {
                warn!(error = %err, "failed to read due notifications");
                continue;
            }
        };
        for notification in due {
            println!(
                "[{}] {}: {}",
                format_local_instant(notification.trigger_at, &scheduler.timezone()),
                notification.title,
                notification.body
            );
            scheduler.on_fired(&notification.alarm_id).await;
        }
    }
}
