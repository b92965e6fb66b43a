use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Injectable time source.
///
/// All components take a `Clock` instead of calling `Utc::now()` directly so
/// that scheduler ticks, lease expiry, and retry backoff are testable without
/// wall-clock sleeps.
pub trait Clock: Send + Sync + Clone {
    /// Current wall-clock time.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Monotonic instant for interval measurement.
    fn instant(&self) -> Instant;
}

/// Production clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }
}

/// Test clock whose wall-clock time only moves when told to.
///
/// The monotonic instant still comes from the OS; pure time arithmetic
/// (bucket refill, lease TTLs, cron next-fire) goes through `now_utc`.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn at(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, delta: ChronoDuration) {
        let mut now = self.now.lock().unwrap();
        *now += delta;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap() = to;
    }
}

impl Clock for ManualClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }
}
