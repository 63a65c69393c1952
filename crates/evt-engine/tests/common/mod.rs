//! Shared fixtures for engine integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use evt_core::{EventId, ManualClock, Scope};
use evt_engine::{Action, Engine, EngineConfig, PollReport};

/// An engine driven by a manual clock; nothing runs until the test polls
pub struct ManualEngine {
    pub engine: Engine,
    pub clock: ManualClock,
}

impl ManualEngine {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn at(time: DateTime<Utc>) -> Self {
        let clock = ManualClock::at(time);
        let engine = Engine::builder()
            .config(test_config())
            .clock(clock.shared())
            .build()
            .unwrap();
        Self { engine, clock }
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let clock = ManualClock::at(start_time());
        let engine = Engine::builder()
            .config(config)
            .clock(clock.shared())
            .build()
            .unwrap();
        Self { engine, clock }
    }

    /// Advance the clock, then run one poll tick
    pub fn tick(&self, seconds: f64) -> PollReport {
        self.clock.advance_secs(seconds);
        self.engine.poll_once()
    }

    /// Take a reference on a namespace scope, for setting variables
    pub fn scope(&self, namespace: &str) -> Arc<Scope> {
        self.engine.scopes().acquire(namespace)
    }

    pub fn fire_count(&self, id: &EventId) -> u64 {
        self.engine.event_info(id).map(|i| i.fire_count).unwrap_or(0)
    }
}

/// Defaults with back-pressure disabled, so queued fires never skip ticks
pub fn test_config() -> EngineConfig {
    EngineConfig {
        saturation_threshold: 1.0,
        ..EngineConfig::default()
    }
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 30).unwrap()
}

pub fn id(namespace: &str, name: &str) -> EventId {
    EventId::new(namespace, name).unwrap()
}

/// An action counting its runs
pub fn counter() -> (Arc<AtomicUsize>, Action) {
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let action = Action::native(move |_| {
        c.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    (count, action)
}

/// An action counting runs per event identity
pub fn per_event_counter() -> (Arc<Mutex<HashMap<EventId, usize>>>, Action) {
    let counts: Arc<Mutex<HashMap<EventId, usize>>> = Arc::default();
    let c = counts.clone();
    let action = Action::native(move |ctx| {
        *c.lock().unwrap().entry(ctx.event().clone()).or_default() += 1;
        Ok(())
    });
    (counts, action)
}

/// Poll `condition` until it holds or about two seconds pass
pub async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
