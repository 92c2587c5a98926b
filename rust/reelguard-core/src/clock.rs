//! Wall-clock access.
//!
//! Block windows and daily counters are stored as wall-clock values, so they
//! go through a [`Clock`] that tests can pin. Timer delays use tokio's
//! monotonic clock instead and never read from here.

use chrono::{FixedOffset, Local, NaiveDate, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
}

/// The system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Where one counting day ends and the next begins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DayBoundary {
    /// Midnight in the host's local time zone.
    #[default]
    Local,
    /// Midnight at a fixed offset east of UTC, in minutes.
    FixedOffset { minutes: i32 },
}

impl DayBoundary {
    /// Calendar date containing `now_ms` under this boundary.
    pub fn date_of(&self, now_ms: i64) -> NaiveDate {
        let utc = Utc
            .timestamp_millis_opt(now_ms)
            .single()
            .unwrap_or_else(Utc::now);
        match self {
            DayBoundary::Local => utc.with_timezone(&Local).date_naive(),
            DayBoundary::FixedOffset { minutes } => {
                let offset =
                    FixedOffset::east_opt(minutes.saturating_mul(60)).unwrap_or_else(|| Utc.fix());
                utc.with_timezone(&offset).date_naive()
            }
        }
    }

    /// `date_of` rendered as `YYYY-MM-DD`, the form counters persist.
    pub fn date_key(&self, now_ms: i64) -> String {
        self.date_of(now_ms).format("%Y-%m-%d").to_string()
    }
}
