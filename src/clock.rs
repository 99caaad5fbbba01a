use chrono::{DateTime, Utc};
use chrono_tz::Tz;

/// Source of "now" in the zone alarm windows are interpreted in.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Tz>;

    fn timezone(&self) -> Tz {
        self.now().timezone()
    }
}

pub struct SystemClock {
    timezone: Tz,
}

impl SystemClock {
    pub fn new(timezone: Tz) -> Self {
        Self { timezone }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Tz> {
        Utc::now().with_timezone(&self.timezone)
    }

    fn timezone(&self) -> Tz {
        self.timezone
    }
}
