use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::alarm::format::format_next_trigger;
use crate::alarm::horizon::{ScanLimits, next_trigger, upcoming_triggers};
use crate::alarm::model::{Alarm, AlarmPatch};
use crate::clock::Clock;
use crate::config::SchedulerSettings;
use crate::diagnostics::{AlarmDiagnostics, DiagnosticsReport};
use crate::platform::{NotificationHandle, NotificationPlatform, NotificationRequest, PlatformError};
use crate::store::{AlarmStore, StoreError};

const CHECK_IN_BODY: &str = "Time to check in. How are you feeling?";

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// A fresh batch went to the platform. `scheduled` can be zero when every
    /// platform call failed or the next trigger lies past the batch horizon.
    Scheduled {
        scheduled: usize,
        failed: usize,
        next_trigger: DateTime<Utc>,
    },
    /// Enabled, but nothing falls inside the scan horizon.
    Idle,
    /// Disabled: old notifications cancelled, `next_trigger` cleared.
    Unscheduled,
    /// The record is gone; any notifications it left behind were cancelled.
    Missing,
    /// Another reconciliation for this alarm is running and will rerun.
    Deferred,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FireOutcome {
    Rescheduled(ReconcileOutcome),
    UnknownAlarm,
    RescheduleFailed,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshReport {
    pub reconciled: usize,
    pub scheduled: usize,
    pub idle: usize,
    pub disabled: usize,
    pub failed: usize,
    pub platform_total: Option<usize>,
    pub runaway: bool,
    pub store_failed: bool,
}

#[derive(Debug, Clone, Copy)]
struct InFlightMarker {
    generation: u64,
    rerun_requested: bool,
}

/// Process-local bookkeeping. Never persisted: a restart rebuilds it through
/// [`AlarmScheduler::refresh_all`].
#[derive(Debug, Default)]
struct SchedulerState {
    tracked: HashMap<String, Vec<NotificationHandle>>,
    in_flight: HashMap<String, InFlightMarker>,
    next_generation: u64,
    last_errors: HashMap<String, String>,
}

fn lock_state(state: &Mutex<SchedulerState>) -> MutexGuard<'_, SchedulerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Marks one alarm as being reconciled; released on drop.
struct InFlightGuard<'a> {
    state: &'a Mutex<SchedulerState>,
    alarm_id: String,
    generation: u64,
}

impl<'a> InFlightGuard<'a> {
    /// `None` when a reconciliation is already running for `alarm_id`; that
    /// run is then asked to go once more.
    fn acquire(state: &'a Mutex<SchedulerState>, alarm_id: &str) -> Option<Self> {
        let mut guarded = lock_state(state);
        if let Some(marker) = guarded.in_flight.get_mut(alarm_id) {
            marker.rerun_requested = true;
            return None;
        }
        guarded.next_generation += 1;
        let generation = guarded.next_generation;
        guarded.in_flight.insert(
            alarm_id.to_string(),
            InFlightMarker {
                generation,
                rerun_requested: false,
            },
        );
        Some(Self {
            state,
            alarm_id: alarm_id.to_string(),
            generation,
        })
    }

    /// Ends one pass. Returns `true` when a rerun was requested; otherwise the
    /// marker is released under the same lock, so a later `acquire` either
    /// sees the rerun request honoured or starts its own pass.
    fn finish_pass(&self) -> bool {
        let mut guarded = lock_state(self.state);
        let Some(marker) = guarded.in_flight.get_mut(&self.alarm_id) else {
            return false;
        };
        if marker.generation != self.generation {
            return false;
        }
        if marker.rerun_requested {
            marker.rerun_requested = false;
            return true;
        }
        guarded.in_flight.remove(&self.alarm_id);
        false
    }
}

/// Releases the marker when a pass is abandoned without `finish_pass`.
impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut guarded = lock_state(self.state);
        let ours = guarded
            .in_flight
            .get(&self.alarm_id)
            .is_some_and(|marker| marker.generation == self.generation);
        if ours {
            guarded.in_flight.remove(&self.alarm_id);
        }
    }
}

/// Keeps the platform's notification schedule in step with the stored alarms.
///
/// Every public operation reports failure through its return value; nothing
/// here panics or propagates errors to the caller's UI layer.
pub struct AlarmScheduler {
    store: Arc<dyn AlarmStore>,
    platform: Arc<dyn NotificationPlatform>,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
    state: Mutex<SchedulerState>,
}

impl AlarmScheduler {
    pub fn new(
        store: Arc<dyn AlarmStore>,
        platform: Arc<dyn NotificationPlatform>,
        clock: Arc<dyn Clock>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            store,
            platform,
            clock,
            settings,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    pub fn timezone(&self) -> Tz {
        self.clock.timezone()
    }

    pub fn now_utc(&self) -> DateTime<Utc> {
        self.clock.now().with_timezone(&Utc)
    }

    #[cfg(test)]
    pub fn tracked_handles(&self, alarm_id: &str) -> usize {
        lock_state(&self.state)
            .tracked
            .get(alarm_id)
            .map_or(0, Vec::len)
    }

    pub async fn get_alarms(&self) -> Vec<Alarm> {
        match self.store.get_alarms().await {
            Ok(alarms) => alarms,
            Err(err) => {
                warn!(error = %err, "failed to load alarms");
                Vec::new()
            }
        }
    }

    /// Stores the alarm (assigning an id if it has none) and schedules it.
    pub async fn save_alarm(&self, mut alarm: Alarm) -> Option<String> {
        if alarm.id.trim().is_empty() {
            alarm.id = Uuid::new_v4().to_string();
        }
        alarm.next_trigger = None;
        if let Err(err) = alarm.validate() {
            warn!(alarm_id = %alarm.id, error = %err, "rejected alarm");
            return None;
        }

        let id = alarm.id.clone();
        if let Err(err) = self.store.save_alarm(alarm).await {
            warn!(alarm_id = %id, error = %err, "failed to save alarm");
            return None;
        }
        self.reconcile_logged(&id).await;
        Some(id)
    }

    /// Applies a user edit. Engine-owned fields in `patch` are ignored.
    pub async fn update_alarm(&self, alarm_id: &str, patch: AlarmPatch) -> bool {
        let patch = patch.without_derived();
        let alarms = match self.store.get_alarms().await {
            Ok(alarms) => alarms,
            Err(err) => {
                warn!(alarm_id, error = %err, "failed to load alarm for update");
                return false;
            }
        };
        let Some(current) = alarms.into_iter().find(|alarm| alarm.id == alarm_id) else {
            warn!(alarm_id, "cannot update unknown alarm");
            return false;
        };

        let was_enabled = current.enabled;
        let mut edited = current;
        patch.clone().apply(&mut edited);
        if let Err(err) = edited.validate() {
            warn!(alarm_id, error = %err, "rejected alarm edit");
            return false;
        }
        if let Err(err) = self.store.update_alarm(alarm_id, patch).await {
            warn!(alarm_id, error = %err, "failed to update alarm");
            return false;
        }
        if was_enabled || edited.enabled {
            self.reconcile_logged(alarm_id).await;
        }
        true
    }

    pub async fn toggle_alarm(&self, alarm_id: &str, enabled: bool) -> bool {
        if let Err(err) = self
            .store
            .update_alarm(alarm_id, AlarmPatch::enabled(enabled))
            .await
        {
            warn!(alarm_id, enabled, error = %err, "failed to toggle alarm");
            return false;
        }
        self.reconcile_logged(alarm_id).await;
        true
    }

    pub async fn delete_alarm(&self, alarm_id: &str) -> bool {
        if let Err(err) = self.store.delete_alarm(alarm_id).await {
            warn!(alarm_id, error = %err, "failed to delete alarm");
            return false;
        }
        self.reconcile_logged(alarm_id).await;
        true
    }

    /// Removes every alarm and everything scheduled on the platform.
    pub async fn clear_all(&self) -> bool {
        if let Err(err) = self.platform.cancel_all().await {
            warn!(error = %err, "platform cancel-all failed");
        }
        {
            let mut state = lock_state(&self.state);
            state.tracked.clear();
            state.last_errors.clear();
        }
        match self.store.clear_all().await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "failed to clear alarms");
                false
            }
        }
    }

    pub fn format_next_trigger(&self, alarm: &Alarm) -> String {
        format_next_trigger(alarm, self.now_utc())
    }

    /// Cancels what this alarm has on the platform and schedules a fresh batch.
    ///
    /// OPEN QUESTION: a call that overlaps a running reconciliation for the
    /// same alarm does no platform work of its own. Instead it sets a single
    /// rerun slot, and the running call goes once more against the latest
    /// stored record before releasing the alarm. Any number of overlapping
    /// calls collapse into that one rerun. Dropping them outright would be
    /// cheaper but can lose an edit made mid-flight.
    pub async fn reconcile(&self, alarm_id: &str) -> Result<ReconcileOutcome, StoreError> {
        let Some(guard) = InFlightGuard::acquire(&self.state, alarm_id) else {
            debug!(alarm_id, "reconcile already in flight; rerun requested");
            return Ok(ReconcileOutcome::Deferred);
        };
        loop {
            let result = self.reconcile_once(alarm_id).await;
            if guard.finish_pass() {
                debug!(alarm_id, "alarm changed during reconcile; running again");
                continue;
            }
            return result;
        }
    }

    async fn reconcile_logged(&self, alarm_id: &str) {
        if let Err(err) = self.reconcile(alarm_id).await {
            warn!(alarm_id, error = %err, "failed to reconcile alarm");
            self.record_error(alarm_id, format!("reconcile failed: {err}"));
        }
    }

    async fn reconcile_once(&self, alarm_id: &str) -> Result<ReconcileOutcome, StoreError> {
        let alarms = self.store.get_alarms().await?;
        let Some(alarm) = alarms.into_iter().find(|alarm| alarm.id == alarm_id) else {
            self.cancel_tracked(alarm_id).await;
            lock_state(&self.state).last_errors.remove(alarm_id);
            debug!(alarm_id, "alarm no longer stored; schedule cleared");
            return Ok(ReconcileOutcome::Missing);
        };

        self.cancel_tracked(&alarm.id).await;

        if !alarm.enabled {
            if alarm.next_trigger.is_some() {
                self.store
                    .update_alarm(&alarm.id, AlarmPatch::next_trigger(None))
                    .await?;
            }
            lock_state(&self.state).last_errors.remove(&alarm.id);
            debug!(alarm_id, "alarm disabled; schedule cleared");
            return Ok(ReconcileOutcome::Unscheduled);
        }

        let now = self.clock.now();
        let (handles, failed) = self.schedule_batch(&alarm, &now).await;
        let scheduled = handles.len();
        lock_state(&self.state)
            .tracked
            .insert(alarm.id.clone(), handles);

        let next = next_trigger(&alarm, &now, self.scan_limits()).map(|at| at.with_timezone(&Utc));
        self.store
            .update_alarm(&alarm.id, AlarmPatch::next_trigger(next))
            .await?;

        match next {
            Some(_) if scheduled == 0 && failed > 0 => self.record_error(
                &alarm.id,
                format!("no notifications scheduled; {failed} platform calls failed"),
            ),
            Some(next_trigger) if scheduled == 0 => self.record_error(
                &alarm.id,
                format!(
                    "no notifications scheduled; next trigger {next_trigger} lies beyond the {}-day batch horizon",
                    self.settings.schedule_horizon_days
                ),
            ),
            _ => {
                lock_state(&self.state).last_errors.remove(&alarm.id);
            }
        }

        match next {
            Some(next_trigger) => {
                info!(alarm_id, scheduled, failed, %next_trigger, "alarm reconciled");
                Ok(ReconcileOutcome::Scheduled {
                    scheduled,
                    failed,
                    next_trigger,
                })
            }
            None => {
                info!(alarm_id, "alarm idle: no trigger inside the scan horizon");
                Ok(ReconcileOutcome::Idle)
            }
        }
    }

    /// Cancels tracked handles first, then anything else the platform still
    /// lists for this alarm (handles lost to a crash or restart).
    async fn cancel_tracked(&self, alarm_id: &str) {
        let tracked = lock_state(&self.state)
            .tracked
            .remove(alarm_id)
            .unwrap_or_default();
        for handle in &tracked {
            if let Err(err) = self.platform.cancel(handle).await {
                warn!(alarm_id, %handle, error = %err, "failed to cancel notification");
            }
        }

        let listed = match self.platform.list_scheduled().await {
            Ok(listed) => listed,
            Err(err) => {
                debug!(alarm_id, error = %err, "platform listing unavailable; sweep skipped");
                return;
            }
        };
        for stray in listed.iter().filter(|notification| notification.alarm_id == alarm_id) {
            debug!(alarm_id, handle = %stray.handle, "cancelling untracked notification");
            if let Err(err) = self.platform.cancel(&stray.handle).await {
                warn!(alarm_id, handle = %stray.handle, error = %err, "failed to cancel notification");
            }
        }
    }

    async fn schedule_batch(
        &self,
        alarm: &Alarm,
        now: &DateTime<Tz>,
    ) -> (Vec<NotificationHandle>, usize) {
        let limits = ScanLimits::new(
            self.settings.schedule_horizon_days,
            self.settings.trigger_buffer(),
        );
        let candidates = upcoming_triggers(alarm, now, limits, usize::MAX);
        let mut handles = Vec::with_capacity(self.settings.batch_size);
        let mut failed = 0;
        for trigger_at in candidates {
            if handles.len() >= self.settings.batch_size {
                break;
            }
            let request = NotificationRequest {
                alarm_id: alarm.id.clone(),
                title: alarm.name.clone(),
                body: CHECK_IN_BODY.to_string(),
                trigger_at: trigger_at.with_timezone(&Utc),
                sound: alarm.sound.platform_resource(),
            };
            match self.platform.schedule_at(request).await {
                Ok(handle) => handles.push(handle),
                Err(PlatformError::CapacityExceeded { limit }) => {
                    failed += 1;
                    warn!(alarm_id = %alarm.id, limit, "platform schedule is full; batch cut short");
                    break;
                }
                Err(err) => {
                    failed += 1;
                    warn!(alarm_id = %alarm.id, %trigger_at, error = %err, "platform refused notification; skipping");
                }
            }
        }
        (handles, failed)
    }

    /// Reconciles enabled alarms that hold no platform notifications but whose
    /// stored next trigger has come inside the batch horizon. Those alarms
    /// never fire, so nothing else would pick them up again.
    pub async fn reconcile_entering_horizon(&self) -> usize {
        let alarms = match self.store.get_alarms().await {
            Ok(alarms) => alarms,
            Err(err) => {
                warn!(error = %err, "horizon catch-up could not load alarms");
                return 0;
            }
        };
        let horizon_end =
            self.now_utc() + chrono::Duration::days(i64::from(self.settings.schedule_horizon_days));
        let pending = {
            let state = lock_state(&self.state);
            alarms
                .into_iter()
                .filter(|alarm| alarm.enabled)
                .filter(|alarm| alarm.next_trigger.is_some_and(|next| next <= horizon_end))
                .filter(|alarm| state.tracked.get(&alarm.id).is_none_or(Vec::is_empty))
                .map(|alarm| alarm.id)
                .collect::<Vec<_>>()
        };

        let mut reconciled = 0;
        for alarm_id in pending {
            debug!(alarm_id = %alarm_id, "next trigger entered the batch horizon");
            match self.reconcile(&alarm_id).await {
                Ok(_) => reconciled += 1,
                Err(err) => {
                    warn!(alarm_id = %alarm_id, error = %err, "failed to reconcile alarm");
                    self.record_error(&alarm_id, format!("reconcile failed: {err}"));
                }
            }
        }
        reconciled
    }

    /// Records that a notification for `alarm_id` was delivered, then lines
    /// up the next batch so the recurrence keeps going.
    pub async fn on_fired(&self, alarm_id: &str) -> FireOutcome {
        let fired_at = self.now_utc();
        match self
            .store
            .update_alarm(alarm_id, AlarmPatch::last_triggered(fired_at))
            .await
        {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => {
                warn!(alarm_id, "notification fired for an unknown alarm");
                self.reconcile_logged(alarm_id).await;
                return FireOutcome::UnknownAlarm;
            }
            Err(err) => warn!(alarm_id, error = %err, "failed to record trigger time"),
        }

        let first_error = match self.reconcile(alarm_id).await {
            Ok(outcome) => return FireOutcome::Rescheduled(outcome),
            Err(err) => err,
        };
        warn!(
            alarm_id,
            error = %first_error,
            retry_in_ms = self.settings.retry_delay_ms,
            "reschedule after trigger failed; retrying once"
        );
        tokio::time::sleep(self.settings.retry_delay()).await;

        match self.reconcile(alarm_id).await {
            Ok(outcome) => FireOutcome::Rescheduled(outcome),
            Err(err) => {
                error!(alarm_id, error = %err, "reschedule after trigger failed twice");
                self.record_error(
                    alarm_id,
                    format!("reschedule after trigger failed twice: {err}"),
                );
                FireOutcome::RescheduleFailed
            }
        }
    }

    /// Cancels everything on the platform and rebuilds every enabled alarm.
    pub async fn refresh_all(&self) -> RefreshReport {
        // Some platforms buffer cancellation; ask twice.
        for attempt in 1..=2 {
            if let Err(err) = self.platform.cancel_all().await {
                warn!(attempt, error = %err, "platform cancel-all failed");
            }
        }
        {
            let mut state = lock_state(&self.state);
            state.tracked.clear();
            state.in_flight.clear();
        }

        let mut report = RefreshReport::default();
        let alarms = match self.store.get_alarms().await {
            Ok(alarms) => alarms,
            Err(err) => {
                error!(error = %err, "fleet refresh could not load alarms");
                report.store_failed = true;
                return report;
            }
        };

        for alarm in &alarms {
            if !alarm.enabled {
                report.disabled += 1;
                if alarm.next_trigger.is_some()
                    && let Err(err) = self
                        .store
                        .update_alarm(&alarm.id, AlarmPatch::next_trigger(None))
                        .await
                {
                    warn!(alarm_id = %alarm.id, error = %err, "failed to clear next trigger");
                }
                continue;
            }
            match self.reconcile(&alarm.id).await {
                Ok(ReconcileOutcome::Scheduled { scheduled, .. }) => {
                    report.reconciled += 1;
                    report.scheduled += scheduled;
                }
                Ok(ReconcileOutcome::Idle) => report.idle += 1,
                Ok(_) => {}
                Err(err) => {
                    report.failed += 1;
                    warn!(alarm_id = %alarm.id, error = %err, "failed to reconcile alarm");
                    self.record_error(&alarm.id, format!("reconcile failed: {err}"));
                }
            }
        }

        match self.platform.list_scheduled().await {
            Ok(listed) => {
                report.platform_total = Some(listed.len());
                if listed.len() > self.settings.runaway_ceiling {
                    warn!(
                        platform_total = listed.len(),
                        ceiling = self.settings.runaway_ceiling,
                        "runaway scheduling detected; cancelling everything"
                    );
                    report.runaway = true;
                    if let Err(err) = self.platform.cancel_all().await {
                        error!(error = %err, "emergency cancel-all failed");
                    }
                    lock_state(&self.state).tracked.clear();
                    self.clear_after_runaway(&alarms, listed.len()).await;
                }
            }
            Err(err) => warn!(error = %err, "could not verify platform schedule size"),
        }

        info!(
            reconciled = report.reconciled,
            scheduled = report.scheduled,
            idle = report.idle,
            failed = report.failed,
            runaway = report.runaway,
            "fleet refresh complete"
        );
        report
    }

    /// Tracked handle counts next to what the platform itself reports.
    pub async fn diagnostics(&self) -> DiagnosticsReport {
        let (alarms, store_available) = match self.store.get_alarms().await {
            Ok(alarms) => (alarms, true),
            Err(err) => {
                warn!(error = %err, "diagnostics could not load alarms");
                (Vec::new(), false)
            }
        };
        let listed = match self.platform.list_scheduled().await {
            Ok(listed) => Some(listed),
            Err(err) => {
                warn!(error = %err, "diagnostics could not list platform schedule");
                None
            }
        };

        let state = lock_state(&self.state);
        let entries = alarms
            .iter()
            .map(|alarm| AlarmDiagnostics {
                id: alarm.id.clone(),
                name: alarm.name.clone(),
                enabled: alarm.enabled,
                tracked_handles: state.tracked.get(&alarm.id).map_or(0, Vec::len),
                platform_scheduled: listed.as_ref().map(|listed| {
                    listed
                        .iter()
                        .filter(|notification| notification.alarm_id == alarm.id)
                        .count()
                }),
                next_trigger: alarm.next_trigger,
                last_triggered: alarm.last_triggered,
                last_error: state.last_errors.get(&alarm.id).cloned(),
            })
            .collect();
        let orphaned = listed.as_ref().map_or(0, |listed| {
            listed
                .iter()
                .filter(|notification| !alarms.iter().any(|alarm| alarm.id == notification.alarm_id))
                .count()
        });

        DiagnosticsReport {
            platform: self.platform.platform_name().to_string(),
            platform_total: listed.as_ref().map(Vec::len),
            store_available,
            orphaned,
            alarms: entries,
        }
    }

    /// Nothing is scheduled after an emergency cancel, so no alarm keeps a
    /// countdown; each enabled one carries the reason until it is rebuilt.
    async fn clear_after_runaway(&self, alarms: &[Alarm], platform_total: usize) {
        for alarm in alarms.iter().filter(|alarm| alarm.enabled) {
            if let Err(err) = self
                .store
                .update_alarm(&alarm.id, AlarmPatch::next_trigger(None))
                .await
            {
                warn!(alarm_id = %alarm.id, error = %err, "failed to clear next trigger");
            }
            self.record_error(
                &alarm.id,
                format!(
                    "runaway schedule ({platform_total} pending notifications) cancelled; run a refresh"
                ),
            );
        }
    }

    fn scan_limits(&self) -> ScanLimits {
        ScanLimits::new(
            self.settings.scan_horizon_days,
            self.settings.trigger_buffer(),
        )
    }

    fn record_error(&self, alarm_id: &str, message: String) {
        lock_state(&self.state)
            .last_errors
            .insert(alarm_id.to_string(), message);
    }
}
