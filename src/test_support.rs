//! In-memory doubles for the store, the platform, and the clock.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use tokio::sync::Semaphore;

use crate::alarm::model::{Alarm, AlarmPatch};
use crate::clock::Clock;
use crate::platform::{
    NotificationHandle, NotificationPlatform, NotificationRequest, PlatformError,
    ScheduledNotification,
};
use crate::store::{AlarmStore, StoreError};

pub fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Tz> {
    Tz::UTC
        .with_ymd_and_hms(y, m, d, h, min, 0)
        .single()
        .expect("valid instant")
}

pub struct ManualClock {
    now: Mutex<DateTime<Tz>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Tz>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Tz>) {
        *self.now.lock().expect("clock lock") = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Tz> {
        *self.now.lock().expect("clock lock")
    }
}

#[derive(Default)]
pub struct MemoryStore {
    alarms: Mutex<Vec<Alarm>>,
    /// One entry per upcoming `get_alarms` call; `true` fails that call.
    read_script: Mutex<VecDeque<bool>>,
    fail_writes: Mutex<bool>,
}

impl MemoryStore {
    pub fn with_alarms(alarms: Vec<Alarm>) -> Self {
        Self {
            alarms: Mutex::new(alarms),
            ..Self::default()
        }
    }

    pub fn script_reads(&self, script: &[bool]) {
        *self.read_script.lock().expect("store lock") = script.iter().copied().collect();
    }

    pub fn fail_writes(&self, fail: bool) {
        *self.fail_writes.lock().expect("store lock") = fail;
    }

    pub fn alarm(&self, id: &str) -> Option<Alarm> {
        self.alarms
            .lock()
            .expect("store lock")
            .iter()
            .find(|alarm| alarm.id == id)
            .cloned()
    }

    fn check_write(&self) -> Result<(), StoreError> {
        if *self.fail_writes.lock().expect("store lock") {
            return Err(StoreError::Io(std::io::Error::other("store offline")));
        }
        Ok(())
    }
}

#[async_trait]
impl AlarmStore for MemoryStore {
    async fn get_alarms(&self) -> Result<Vec<Alarm>, StoreError> {
        let fail = self
            .read_script
            .lock()
            .expect("store lock")
            .pop_front()
            .unwrap_or(false);
        if fail {
            return Err(StoreError::Io(std::io::Error::other("store offline")));
        }
        Ok(self.alarms.lock().expect("store lock").clone())
    }

    async fn save_alarm(&self, alarm: Alarm) -> Result<(), StoreError> {
        self.check_write()?;
        alarm.validate()?;
        let mut alarms = self.alarms.lock().expect("store lock");
        match alarms.iter_mut().find(|existing| existing.id == alarm.id) {
            Some(existing) => *existing = alarm,
            None => alarms.push(alarm),
        }
        Ok(())
    }

    async fn update_alarm(&self, id: &str, patch: AlarmPatch) -> Result<(), StoreError> {
        self.check_write()?;
        let mut alarms = self.alarms.lock().expect("store lock");
        let alarm = alarms
            .iter_mut()
            .find(|existing| existing.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        patch.apply(alarm);
        Ok(())
    }

    async fn delete_alarm(&self, id: &str) -> Result<(), StoreError> {
        self.check_write()?;
        let mut alarms = self.alarms.lock().expect("store lock");
        let before = alarms.len();
        alarms.retain(|existing| existing.id != id);
        if alarms.len() == before {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), StoreError> {
        self.check_write()?;
        self.alarms.lock().expect("store lock").clear();
        Ok(())
    }
}

#[derive(Default)]
struct MockPlatformInner {
    next: u64,
    scheduled: Vec<ScheduledNotification>,
    fail_calls: HashSet<usize>,
    phantom: usize,
}

/// Records every call; can fail chosen `schedule_at` calls or hold them open.
#[derive(Default)]
pub struct MockPlatform {
    inner: Mutex<MockPlatformInner>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    schedule_calls: AtomicUsize,
    cancel_calls: AtomicUsize,
    cancel_all_calls: AtomicUsize,
}

impl MockPlatform {
    /// Fails the `schedule_at` calls with these zero-based call indices.
    pub fn fail_schedule_calls(&self, calls: &[usize]) {
        self.inner.lock().expect("platform lock").fail_calls = calls.iter().copied().collect();
    }

    /// Reports extra entries from `list_scheduled` that nothing tracks and
    /// that survive `cancel_all`.
    pub fn report_phantoms(&self, count: usize) {
        self.inner.lock().expect("platform lock").phantom = count;
    }

    /// Every `schedule_at` waits for a permit from `gate` before completing.
    pub fn hold_schedules(&self, gate: Arc<Semaphore>) {
        *self.gate.lock().expect("platform lock") = Some(gate);
    }

    pub fn schedule_calls(&self) -> usize {
        self.schedule_calls.load(Ordering::SeqCst)
    }

    pub fn cancel_calls(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    pub fn cancel_all_calls(&self) -> usize {
        self.cancel_all_calls.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> Vec<ScheduledNotification> {
        self.inner.lock().expect("platform lock").scheduled.clone()
    }

    pub fn live_for(&self, alarm_id: &str) -> Vec<DateTime<Utc>> {
        self.live()
            .into_iter()
            .filter(|notification| notification.alarm_id == alarm_id)
            .map(|notification| notification.trigger_at)
            .collect()
    }
}

#[async_trait]
impl NotificationPlatform for MockPlatform {
    async fn schedule_at(
        &self,
        request: NotificationRequest,
    ) -> Result<NotificationHandle, PlatformError> {
        let call = self.schedule_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().expect("platform lock").clone();
        if let Some(gate) = gate {
            gate.acquire().await.expect("gate open").forget();
        }

        let mut inner = self.inner.lock().expect("platform lock");
        if inner.fail_calls.contains(&call) {
            return Err(PlatformError::Rejected(format!("call {call} refused")));
        }
        inner.next += 1;
        let handle = NotificationHandle::new(format!("mock-{}", inner.next));
        inner.scheduled.push(ScheduledNotification {
            handle: handle.clone(),
            alarm_id: request.alarm_id,
            title: request.title,
            body: request.body,
            trigger_at: request.trigger_at,
            sound: request.sound.to_string(),
        });
        Ok(handle)
    }

    async fn cancel(&self, handle: &NotificationHandle) -> Result<(), PlatformError> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().expect("platform lock");
        inner.scheduled.retain(|notification| &notification.handle != handle);
        Ok(())
    }

    async fn cancel_all(&self) -> Result<(), PlatformError> {
        self.cancel_all_calls.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().expect("platform lock");
        inner.scheduled.clear();
        Ok(())
    }

    async fn list_scheduled(&self) -> Result<Vec<ScheduledNotification>, PlatformError> {
        let inner = self.inner.lock().expect("platform lock");
        let mut listed = inner.scheduled.clone();
        for index in 0..inner.phantom {
            listed.push(ScheduledNotification {
                handle: NotificationHandle::new(format!("phantom-{index}")),
                alarm_id: "phantom".to_string(),
                title: String::new(),
                body: String::new(),
                trigger_at: Utc::now(),
                sound: "default".to_string(),
            });
        }
        Ok(listed)
    }

    fn platform_name(&self) -> &str {
        "mock"
    }
}
