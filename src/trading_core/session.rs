//! Daily session clock
//!
//! Maps bar timestamps to a time-of-day and a calendar-day key in the
//! exchange timezone. Window checks and daily resets are driven off this.

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, Timelike};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Resolved session position of a timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTime {
    /// Minutes since local midnight (0..1440)
    pub minute_of_day: u32,
    /// Local calendar day, used as the daily reset key
    pub day: NaiveDate,
}

/// Pure `(epoch_ms) -> (minute_of_day, day)` mapping
pub trait SessionClock {
    fn resolve(&self, epoch_ms: i64) -> SessionTime;
}

/// Session clock for an IANA timezone
#[derive(Debug, Clone, Copy)]
pub struct TzSessionClock {
    tz: Tz,
}

impl Default for TzSessionClock {
    fn default() -> Self {
        Self {
            tz: chrono_tz::America::New_York,
        }
    }
}

impl TzSessionClock {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    /// Build from a timezone name such as "America/New_York"
    pub fn from_name(name: &str) -> Result<Self> {
        let tz: Tz = name
            .parse()
            .map_err(|e| anyhow!("Unknown timezone {}: {}", name, e))?;
        Ok(Self { tz })
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }
}

impl SessionClock for TzSessionClock {
    fn resolve(&self, epoch_ms: i64) -> SessionTime {
        let utc = DateTime::from_timestamp_millis(epoch_ms).unwrap_or_default();
        let local = utc.with_timezone(&self.tz);
        SessionTime {
            minute_of_day: local.hour() * 60 + local.minute(),
            day: local.date_naive(),
        }
    }
}

/// Half-open time-of-day window `[start, end)`; wraps midnight when end < start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionWindow {
    pub start_minute: u32,
    pub end_minute: u32,
}

impl SessionWindow {
    pub fn new(start_hour: u32, start_minute: u32, end_hour: u32, end_minute: u32) -> Self {
        Self {
            start_minute: start_hour * 60 + start_minute,
            end_minute: end_hour * 60 + end_minute,
        }
    }

    pub fn contains(&self, minute_of_day: u32) -> bool {
        if self.start_minute <= self.end_minute {
            minute_of_day >= self.start_minute && minute_of_day < self.end_minute
        } else {
            minute_of_day >= self.start_minute || minute_of_day < self.end_minute
        }
    }
}

impl std::fmt::Display for SessionWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:02}:{:02}-{:02}:{:02}",
            self.start_minute / 60,
            self.start_minute % 60,
            self.end_minute / 60,
            self.end_minute % 60
        )
    }
}
