use anyhow::{Result, bail};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Upper bound on notifications held per alarm at any time.
pub const MAX_BATCH_SIZE: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub batch_size: usize,
    pub schedule_horizon_days: u32,
    pub scan_horizon_days: u32,
    pub trigger_buffer_secs: i64,
    pub runaway_ceiling: usize,
    pub retry_delay_ms: u64,
    pub timezone: Tz,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            batch_size: MAX_BATCH_SIZE,
            schedule_horizon_days: 3,
            scan_horizon_days: 7,
            trigger_buffer_secs: 30,
            runaway_ceiling: 50,
            retry_delay_ms: 1_000,
            timezone: Tz::UTC,
        }
    }
}

impl SchedulerSettings {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            bail!(
                "batch_size must be between 1 and {MAX_BATCH_SIZE}, got {}",
                self.batch_size
            );
        }
        if self.schedule_horizon_days == 0 {
            bail!("schedule_horizon_days must be greater than zero");
        }
        if self.scan_horizon_days == 0 || self.scan_horizon_days > 7 {
            bail!(
                "scan_horizon_days must be between 1 and 7, got {}",
                self.scan_horizon_days
            );
        }
        if self.schedule_horizon_days > self.scan_horizon_days {
            bail!(
                "schedule_horizon_days ({}) must not exceed scan_horizon_days ({})",
                self.schedule_horizon_days,
                self.scan_horizon_days
            );
        }
        if self.trigger_buffer_secs < 0 {
            bail!("trigger_buffer_secs must not be negative");
        }
        if self.runaway_ceiling == 0 {
            bail!("runaway_ceiling must be greater than zero");
        }
        Ok(())
    }

    pub fn trigger_buffer(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.trigger_buffer_secs)
    }

    pub fn retry_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.retry_delay_ms)
    }
}
