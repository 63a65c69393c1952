//! Engine counters

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

/// Weight of the newest sample in the ticks-per-second average
const TPS_SMOOTHING: f64 = 0.02;

#[derive(Debug, Default)]
struct TickTiming {
    last_tick: Option<Duration>,
    avg_tps: f64,
}

/// Counters shared by the poll loop, the fire path and the error reporter
#[derive(Debug, Default)]
pub struct EngineStats {
    ticks: AtomicU64,
    skipped_ticks: AtomicU64,
    fires: AtomicU64,
    suppressed: AtomicU64,
    errors: AtomicU64,
    overflows: AtomicU64,
    timing: Mutex<TickTiming>,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a tick at monotonic time `now` and update the smoothed rate
    pub(crate) fn record_tick(&self, now: Duration) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        let mut timing = self.timing.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(last) = timing.last_tick {
            let elapsed = now.saturating_sub(last).as_secs_f64();
            if elapsed > 0.0 {
                let instant = 1.0 / elapsed;
                timing.avg_tps = if timing.avg_tps == 0.0 {
                    instant
                } else {
                    timing.avg_tps * (1.0 - TPS_SMOOTHING) + instant * TPS_SMOOTHING
                };
            }
        }
        timing.last_tick = Some(now);
    }

    pub(crate) fn record_skipped_tick(&self) {
        self.skipped_ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fire(&self) {
        self.fires.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_suppressed(&self) {
        self.suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_overflow(&self) {
        self.overflows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, events: usize, saturation: f64) -> StatsSnapshot {
        let avg_ticks_per_second = self
            .timing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .avg_tps;
        StatsSnapshot {
            events,
            ticks: self.ticks.load(Ordering::Relaxed),
            skipped_ticks: self.skipped_ticks.load(Ordering::Relaxed),
            fires: self.fires.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
            avg_ticks_per_second,
            saturation,
        }
    }
}

/// Point-in-time copy of the engine counters
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub events: usize,
    pub ticks: u64,
    pub skipped_ticks: u64,
    pub fires: u64,
    pub suppressed: u64,
    pub errors: u64,
    pub overflows: u64,
    pub avg_ticks_per_second: f64,
    pub saturation: f64,
}
