//! Injectable time sources
//!
//! The engine reads time only through [`Clock`], so tests can drive the
//! evaluator and poll loop with a [`ManualClock`] instead of the wall clock.

use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// A source of wall-clock and monotonic time
pub trait Clock: Send + Sync {
    /// Current wall-clock time
    fn now(&self) -> DateTime<Utc>;

    /// Monotonic time elapsed since the clock was created
    fn monotonic(&self) -> Duration;
}

/// Shared handle to a clock
pub type SharedClock = Arc<dyn Clock>;

/// The real clock
///
/// Monotonic time is measured with `tokio::time::Instant`, so it follows
/// tokio's paused test time when that is enabled.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: tokio::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }

    /// Create a shared handle to a new system clock
    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Duration {
        self.origin.elapsed()
    }
}

#[derive(Debug)]
struct ManualState {
    wall: DateTime<Utc>,
    mono: Duration,
}

/// A controllable clock for tests and simulations
///
/// Wall-clock and monotonic time only move when told to. `advance` moves
/// both; `set` jumps the wall clock (forwards or backwards) and moves the
/// monotonic clock by the forward distance only.
#[derive(Debug, Clone)]
pub struct ManualClock {
    state: Arc<RwLock<ManualState>>,
}

impl ManualClock {
    /// Create a manual clock starting at the current time
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    /// Create a manual clock starting at a specific time
    pub fn at(time: DateTime<Utc>) -> Self {
        Self {
            state: Arc::new(RwLock::new(ManualState {
                wall: time,
                mono: Duration::ZERO,
            })),
        }
    }

    /// Set the current wall-clock time
    pub fn set(&self, time: DateTime<Utc>) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if let Ok(forward) = (time - state.wall).to_std() {
            state.mono += forward;
        }
        state.wall = time;
    }

    /// Advance time by a duration
    pub fn advance(&self, duration: Duration) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.mono += duration;
        state.wall += chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
    }

    /// Advance time by (possibly fractional) seconds
    pub fn advance_secs(&self, seconds: f64) {
        self.advance(Duration::from_secs_f64(seconds.max(0.0)));
    }

    /// Advance time by milliseconds
    pub fn advance_millis(&self, millis: u64) {
        self.advance(Duration::from_millis(millis));
    }

    /// Create a shared handle to this clock
    pub fn shared(&self) -> SharedClock {
        Arc::new(self.clone())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.state.read().unwrap_or_else(|e| e.into_inner()).wall
    }

    fn monotonic(&self) -> Duration {
        self.state.read().unwrap_or_else(|e| e.into_inner()).mono
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        clock.advance_secs(3600.0);

        assert_eq!(clock.now().hour(), 1);
        assert_eq!(clock.monotonic(), Duration::from_secs(3600));
    }

    #[test]
    fn test_manual_clock_set_backwards_keeps_monotonic() {
        let start = Utc.with_ymd_and_hms(2025, 6, 15, 12, 30, 0).unwrap();
        let clock = ManualClock::at(start);
        clock.advance_millis(500);

        clock.set(start - chrono::Duration::hours(1));
        assert_eq!(clock.now(), start - chrono::Duration::hours(1));
        assert_eq!(clock.monotonic(), Duration::from_millis(500));

        clock.set(start);
        assert_eq!(clock.monotonic(), Duration::from_millis(500) + Duration::from_secs(3600));
    }

    #[test]
    fn test_shared_handle_sees_updates() {
        let clock = ManualClock::new();
        let shared = clock.shared();
        clock.advance_secs(2.0);
        assert_eq!(shared.monotonic(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_system_clock_follows_paused_time() {
        let clock = SystemClock::new();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(clock.monotonic() >= Duration::from_secs(5));
    }
}
