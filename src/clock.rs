//! Time source abstraction
//!
//! Rate limiting and token expiry read time through [`Clock`] so tests can
//! drive them with [`ManualClock`] instead of sleeping.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Monotonic and wall-clock time source
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current monotonic instant
    fn now(&self) -> Instant;

    /// Current wall-clock time
    fn utc_now(&self) -> DateTime<Utc>;

    /// Suspend until `deadline` has passed
    async fn sleep_until(&self, deadline: Instant);
}

/// Clock backed by the tokio timer and the system wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep_until(&self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}

/// Virtual clock that only moves when told to
///
/// `sleep_until` jumps the clock forward to the deadline and returns
/// immediately, so elapsed virtual time equals the total requested waiting.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    utc_base: DateTime<Utc>,
    offset: Mutex<Duration>,
}

impl ManualClock {
    /// Create a clock frozen at the current moment
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Create a clock whose wall-clock reading starts at `utc`
    pub fn starting_at(utc: DateTime<Utc>) -> Self {
        Self {
            base: Instant::now(),
            utc_base: utc,
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap();
        *offset += by;
    }

    /// Total virtual time elapsed since construction
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.elapsed()).unwrap_or(chrono::Duration::MAX);
        self.utc_base + elapsed
    }

    async fn sleep_until(&self, deadline: Instant) {
        {
            let mut offset = self.offset.lock().unwrap();
            let target = deadline.saturating_duration_since(self.base);
            if target > *offset {
                *offset = target;
            }
        }
        tokio::task::yield_now().await;
    }
}
