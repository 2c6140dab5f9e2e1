//! Wall Clock
//!
//! Single source of "now" for record timestamps and bucket keys. Production
//! code uses [`SystemClock`]; tests drive a [`ManualClock`] so that slot
//! boundaries can be crossed deterministically.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub const NANOS_PER_MICRO: i64 = 1_000;
pub const NANOS_PER_MILLI: i64 = 1_000_000;

/// Source of wall-clock time.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// The operating system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, t: DateTime<Utc>) {
        *self.current.lock() = t;
    }

    pub fn advance(&self, by: std::time::Duration) {
        let delta = ChronoDuration::from_std(by).unwrap_or(ChronoDuration::zero());
        let mut current = self.current.lock();
        *current = *current + delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock()
    }
}

/// Resolution of the persisted `timestamp` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampUnit {
    #[default]
    Nanos,
    Micros,
    Millis,
}

impl TimestampUnit {
    /// Convert an instant to an integer count of this unit since the Unix epoch.
    ///
    /// Nanosecond timestamps saturate outside the i64 range (years 1677-2262).
    pub fn from_datetime(self, t: &DateTime<Utc>) -> i64 {
        match self {
            Self::Nanos => t.timestamp_nanos_opt().unwrap_or(if t.timestamp() < 0 {
                i64::MIN
            } else {
                i64::MAX
            }),
            Self::Micros => t.timestamp_micros(),
            Self::Millis => t.timestamp_millis(),
        }
    }

    /// Nanoseconds per unit.
    pub fn nanos_per_unit(self) -> i64 {
        match self {
            Self::Nanos => 1,
            Self::Micros => NANOS_PER_MICRO,
            Self::Millis => NANOS_PER_MILLI,
        }
    }

    pub fn to_arrow(self) -> arrow::datatypes::TimeUnit {
        match self {
            Self::Nanos => arrow::datatypes::TimeUnit::Nanosecond,
            Self::Micros => arrow::datatypes::TimeUnit::Microsecond,
            Self::Millis => arrow::datatypes::TimeUnit::Millisecond,
        }
    }
}
