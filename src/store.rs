//! Persistent alarm records.
//!
//! The engine only ever talks to [`AlarmStore`]; [`JsonFileStore`] keeps the
//! records in the versioned alarm file next to the scheduler settings.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::alarm::model::{
    Alarm, AlarmFileContents, AlarmPatch, AlarmValidationError, parse_alarm_file_text,
    render_alarm_file,
};
use crate::config::SchedulerSettings;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("alarm store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("alarm store is unreadable: {0}")]
    Format(String),

    #[error("alarm '{0}' not found")]
    NotFound(String),

    #[error("alarm rejected: {0}")]
    Invalid(#[from] AlarmValidationError),
}

#[async_trait]
pub trait AlarmStore: Send + Sync {
    async fn get_alarms(&self) -> Result<Vec<Alarm>, StoreError>;

    /// Inserts, or replaces the record with the same id.
    async fn save_alarm(&self, alarm: Alarm) -> Result<(), StoreError>;

    async fn update_alarm(&self, id: &str, patch: AlarmPatch) -> Result<(), StoreError>;

    async fn delete_alarm(&self, id: &str) -> Result<(), StoreError>;

    async fn clear_all(&self) -> Result<(), StoreError>;
}

pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Settings block of the alarm file, or defaults when the file is absent.
    pub async fn load_settings(&self) -> anyhow::Result<SchedulerSettings> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => Ok(parse_alarm_file_text(&text)?.settings),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(SchedulerSettings::default()),
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("unable to read alarm file {}", self.path.display()))),
        }
    }

    async fn read(&self) -> Result<AlarmFileContents, StoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => parse_alarm_file_text(&text).map_err(|err| StoreError::Format(format!("{err:#}"))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(AlarmFileContents::default()),
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    async fn write(&self, contents: &AlarmFileContents) -> Result<(), StoreError> {
        let text = render_alarm_file(contents).map_err(|err| StoreError::Format(format!("{err:#}")))?;
        let staging = self.path.with_extension("json.tmp");
        tokio::fs::write(&staging, text).await?;
        tokio::fs::rename(&staging, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl AlarmStore for JsonFileStore {
    async fn get_alarms(&self) -> Result<Vec<Alarm>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.alarms)
    }

    async fn save_alarm(&self, alarm: Alarm) -> Result<(), StoreError> {
        alarm.validate()?;
        let _guard = self.lock.lock().await;
        let mut contents = self.read().await?;
        match contents.alarms.iter_mut().find(|existing| existing.id == alarm.id) {
            Some(existing) => *existing = alarm,
            None => contents.alarms.push(alarm),
        }
        self.write(&contents).await
    }

    async fn update_alarm(&self, id: &str, patch: AlarmPatch) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut contents = self.read().await?;
        let alarm = contents
            .alarms
            .iter_mut()
            .find(|existing| existing.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        patch.apply(alarm);
        alarm.validate()?;
        self.write(&contents).await
    }

    async fn delete_alarm(&self, id: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut contents = self.read().await?;
        let before = contents.alarms.len();
        contents.alarms.retain(|existing| existing.id != id);
        if contents.alarms.len() == before {
            return Err(StoreError::NotFound(id.to_string()));
        }
        self.write(&contents).await
    }

    async fn clear_all(&self) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut contents = self.read().await?;
        contents.alarms.clear();
        self.write(&contents).await
    }
}
