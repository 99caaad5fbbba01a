//! Platform notification subsystem.
//!
//! [`NotificationPlatform`] is the seam to whatever actually delivers local
//! notifications. [`SpoolPlatform`] is the bundled implementation: a bounded
//! schedule kept in memory and, optionally, mirrored to a JSON spool file so
//! it outlives the process the way an OS notification schedule does.

use std::fmt;
use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

pub const DEFAULT_SPOOL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("platform refused notification: {0}")]
    Rejected(String),

    #[error("platform schedule is full ({limit} pending notifications)")]
    CapacityExceeded { limit: usize },

    #[error("spool I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("spool file is unreadable: {0}")]
    Format(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationHandle(String);

impl NotificationHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl fmt::Display for NotificationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One notification to deliver at `trigger_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationRequest {
    pub alarm_id: String,
    pub title: String,
    pub body: String,
    pub trigger_at: DateTime<Utc>,
    pub sound: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledNotification {
    pub handle: NotificationHandle,
    /// Payload data: the alarm this notification belongs to.
    pub alarm_id: String,
    pub title: String,
    pub body: String,
    pub trigger_at: DateTime<Utc>,
    pub sound: String,
}

#[async_trait]
pub trait NotificationPlatform: Send + Sync {
    async fn schedule_at(
        &self,
        request: NotificationRequest,
    ) -> Result<NotificationHandle, PlatformError>;

    /// Unknown or already delivered handles are ignored.
    async fn cancel(&self, handle: &NotificationHandle) -> Result<(), PlatformError>;

    async fn cancel_all(&self) -> Result<(), PlatformError>;

    /// Advisory only: some platforms drop delivered items inconsistently.
    async fn list_scheduled(&self) -> Result<Vec<ScheduledNotification>, PlatformError>;

    fn platform_name(&self) -> &str;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SpoolState {
    next_sequence: u64,
    pending: Vec<ScheduledNotification>,
}

pub struct SpoolPlatform {
    path: Option<PathBuf>,
    capacity: usize,
    state: Mutex<SpoolState>,
}

impl SpoolPlatform {
    #[cfg(test)]
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            path: None,
            capacity,
            state: Mutex::new(SpoolState::default()),
        }
    }

    /// Loads the spool file if present; a missing file starts empty.
    pub async fn open(path: impl Into<PathBuf>, capacity: usize) -> Result<Self, PlatformError> {
        let path = path.into();
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(text) => serde_json::from_str::<SpoolState>(&text)?,
            Err(err) if err.kind() == ErrorKind::NotFound => SpoolState::default(),
            Err(err) => return Err(PlatformError::Io(err)),
        };
        Ok(Self {
            path: Some(path),
            capacity,
            state: Mutex::new(state),
        })
    }

    /// Removes and returns everything due at or before `now`, oldest first.
    pub async fn take_due(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledNotification>, PlatformError> {
        let mut state = self.state.lock().await;
        let (mut due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut state.pending)
            .into_iter()
            .partition(|notification| notification.trigger_at <= now);
        state.pending = pending;
        if !due.is_empty() {
            self.persist(&state).await?;
        }
        due.sort_by_key(|notification| notification.trigger_at);
        Ok(due)
    }

    async fn persist(&self, state: &SpoolState) -> Result<(), PlatformError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let text = serde_json::to_string_pretty(state)?;
        tokio::fs::write(path, format!("{text}\n")).await?;
        Ok(())
    }
}

#[async_trait]
impl NotificationPlatform for SpoolPlatform {
    async fn schedule_at(
        &self,
        request: NotificationRequest,
    ) -> Result<NotificationHandle, PlatformError> {
        if request.trigger_at <= Utc::now() {
            return Err(PlatformError::Rejected(format!(
                "trigger time {} has already passed",
                request.trigger_at
            )));
        }
        let mut state = self.state.lock().await;
        if state.pending.len() >= self.capacity {
            return Err(PlatformError::CapacityExceeded {
                limit: self.capacity,
            });
        }
        state.next_sequence += 1;
        let handle = NotificationHandle::new(format!("n-{}", state.next_sequence));
        state.pending.push(ScheduledNotification {
            handle: handle.clone(),
            alarm_id: request.alarm_id,
            title: request.title,
            body: request.body,
            trigger_at: request.trigger_at,
            sound: request.sound.to_string(),
        });
        self.persist(&state).await?;
        Ok(handle)
    }

    async fn cancel(&self, handle: &NotificationHandle) -> Result<(), PlatformError> {
        let mut state = self.state.lock().await;
        let before = state.pending.len();
        state.pending.retain(|notification| &notification.handle != handle);
        if state.pending.len() != before {
            self.persist(&state).await?;
        }
        Ok(())
    }

    async fn cancel_all(&self) -> Result<(), PlatformError> {
        let mut state = self.state.lock().await;
        state.pending.clear();
        self.persist(&state).await
    }

    async fn list_scheduled(&self) -> Result<Vec<ScheduledNotification>, PlatformError> {
        let state = self.state.lock().await;
        Ok(state.pending.clone())
    }

    fn platform_name(&self) -> &str {
        if self.path.is_some() { "spool-file" } else { "spool-memory" }
    }
}
