//! Trigger and poll-loop behaviour, driven tick by tick with a manual clock

mod common;

use chrono::{TimeZone, Utc};
use common::{id, test_config, ManualEngine};
use evt_core::{Priority, Value};
use evt_engine::{
    Action, EngineConfig, EngineError, EventDefinition, EventOptions, TriggerKind, WorkersConfig,
};

fn noop() -> Action {
    Action::native(|_| Ok(()))
}

#[test]
fn test_edge_trigger_fires_once_while_true() {
    let t = ManualEngine::new();
    let scope = t.scope("mod");
    scope.set("x", true);

    let ev = id("mod", "edge");
    t.engine
        .register(
            EventDefinition::parse(ev.clone(), "x", noop())
                .unwrap()
                .with_options(EventOptions::new().allow_overlap()),
        )
        .unwrap();

    let fired: Vec<usize> = (0..5).map(|_| t.tick(0.1).fired).collect();
    assert_eq!(fired, vec![1, 0, 0, 0, 0]);

    scope.set("x", false);
    t.tick(0.1);
    scope.set("x", true);
    assert_eq!(t.tick(0.1).fired, 1);
    assert_eq!(t.fire_count(&ev), 2);
}

#[test]
fn test_rate_limit_is_a_filter() {
    let t = ManualEngine::new();
    let ev = id("mod", "limited");
    t.engine
        .register(
            EventDefinition::parse(ev.clone(), "true", noop())
                .unwrap()
                .with_options(
                    EventOptions::new()
                        .continual()
                        .allow_overlap()
                        .rate_limit_secs(1.0),
                ),
        )
        .unwrap();

    let mut fire_ticks = Vec::new();
    for tick in 0..30 {
        if t.tick(0.1).fired > 0 {
            fire_ticks.push(tick);
        }
    }

    assert_eq!(fire_ticks, vec![0, 10, 20]);
    let stats = t.engine.stats();
    assert_eq!(stats.fires, 3);
    assert_eq!(stats.suppressed, 27);
}

#[test]
fn test_once_event_leaves_registry_after_first_fire() {
    let t = ManualEngine::new();
    let scope = t.scope("mod");
    scope.set("x", true);

    let ev = id("mod", "once");
    t.engine
        .register(
            EventDefinition::parse(ev.clone(), "x", noop())
                .unwrap()
                .with_options(EventOptions::new().once()),
        )
        .unwrap();

    assert_eq!(t.tick(0.1).fired, 1);
    assert!(!t.engine.contains(&ev));
    assert!(t.engine.events().is_empty());

    scope.set("x", false);
    t.tick(0.1);
    scope.set("x", true);
    assert_eq!(t.tick(0.1).fired, 0);
    assert_eq!(t.engine.stats().fires, 1);
}

#[test]
fn test_on_change_fires_per_distinct_change() {
    let t = ManualEngine::new();
    let scope = t.scope("mod");
    scope.set("v", 0);

    let ev = id("mod", "changed");
    t.engine
        .register(
            EventDefinition::parse(ev.clone(), "!onchange v", noop())
                .unwrap()
                .with_options(EventOptions::new().allow_overlap()),
        )
        .unwrap();

    let mut fired = Vec::new();
    for v in [0, 0, 1, 1, 2] {
        scope.set("v", v);
        fired.push(t.tick(0.1).fired);
    }
    assert_eq!(fired, vec![0, 0, 1, 0, 1]);
    assert_eq!(t.fire_count(&ev), 2);
}

#[test]
fn test_on_change_expression() {
    let t = ManualEngine::new();
    let scope = t.scope("mod");
    scope.set("temp", 10);

    let ev = id("mod", "band");
    t.engine
        .register(
            EventDefinition::parse(ev.clone(), "!onchange temp > 20", noop())
                .unwrap()
                .with_options(EventOptions::new().allow_overlap()),
        )
        .unwrap();

    for temp in [12, 15, 25, 30, 18] {
        scope.set("temp", temp);
        t.tick(0.1);
    }
    // false -> true at 25, true -> false at 18
    assert_eq!(t.fire_count(&ev), 2);
}

#[test]
fn test_evaluation_error_is_isolated_and_backed_off() {
    let t = ManualEngine::new();
    let scope = t.scope("mod");
    scope.set("x", true);

    let bad = id("mod", "bad");
    let good = id("mod", "good");
    t.engine
        .register(EventDefinition::parse(bad.clone(), "missing > 1", noop()).unwrap())
        .unwrap();
    t.engine
        .register(
            EventDefinition::parse(good.clone(), "x", noop())
                .unwrap()
                .with_options(EventOptions::new().continual().allow_overlap()),
        )
        .unwrap();

    let report = t.tick(0.1);
    assert_eq!(report.evaluated, 2);
    assert_eq!(report.errors, 1);
    assert_eq!(report.fired, 1);

    // interactive backoff is one second
    let report = t.tick(0.1);
    assert_eq!(report.evaluated, 1);
    assert_eq!(report.fired, 1);

    for _ in 0..9 {
        t.tick(0.1);
    }
    let info = t.engine.event_info(&bad).unwrap();
    assert_eq!(info.error_count, 2);
    assert_eq!(info.errors[0].kind, "expression_evaluation");
    assert!(info.errors[0].message.contains("missing"));
    assert_eq!(t.fire_count(&good), 11);
}

#[test]
fn test_disable_and_reenable_needs_new_edge() {
    let t = ManualEngine::new();
    let scope = t.scope("mod");
    scope.set("x", false);

    let ev = id("mod", "paused");
    t.engine
        .register(
            EventDefinition::parse(ev.clone(), "x", noop())
                .unwrap()
                .with_options(EventOptions::new().allow_overlap()),
        )
        .unwrap();
    t.tick(0.1);

    t.engine.set_enabled(&ev, false).unwrap();
    scope.set("x", true);
    assert_eq!(t.tick(0.1).fired, 0);
    assert!(!t.engine.event_info(&ev).unwrap().enabled);

    t.engine.set_enabled(&ev, true).unwrap();
    assert_eq!(t.tick(0.1).fired, 0);
    scope.set("x", false);
    t.tick(0.1);
    scope.set("x", true);
    assert_eq!(t.tick(0.1).fired, 1);

    assert!(matches!(
        t.engine.set_enabled(&id("mod", "nope"), true),
        Err(EngineError::NotFound(_))
    ));
}

#[test]
fn test_time_trigger_fires_from_poll_loop() {
    let t = ManualEngine::at(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 30).unwrap());
    let ev = id("clock", "minutely");
    t.engine
        .register(
            EventDefinition::parse(ev.clone(), "!time every minute in utc", noop())
                .unwrap()
                .with_options(EventOptions::new().allow_overlap()),
        )
        .unwrap();

    let info = t.engine.event_info(&ev).unwrap();
    assert_eq!(info.kind, TriggerKind::TimeSpec);
    assert_eq!(
        info.next_fire,
        Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 1, 0).unwrap())
    );

    assert_eq!(t.tick(29.0).fired, 0);
    assert_eq!(t.tick(1.0).fired, 1);
    assert_eq!(t.tick(0.1).fired, 0);
    assert_eq!(
        t.engine.event_info(&ev).unwrap().next_fire,
        Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 2, 0).unwrap())
    );
}

#[test]
fn test_exact_time_trigger_skips_late_occurrence() {
    let t = ManualEngine::at(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 30).unwrap());
    let ev = id("clock", "exact");
    t.engine
        .register(
            EventDefinition::parse(ev.clone(), "!time every minute in utc exact 3", noop())
                .unwrap()
                .with_options(EventOptions::new().allow_overlap()),
        )
        .unwrap();

    // 12:01:10 is past the 3 second tolerance for 12:01:00
    assert_eq!(t.tick(40.0).fired, 0);
    assert_eq!(t.tick(30.0).fired, 0);
    // 12:02:01 is within it
    assert_eq!(t.tick(21.0).fired, 1);
}

#[test]
fn test_low_priority_polls_less_often() {
    let t = ManualEngine::new();
    let ev = id("mod", "slow");
    t.engine
        .register(
            EventDefinition::parse(ev.clone(), "true", noop())
                .unwrap()
                .with_options(
                    EventOptions::new()
                        .continual()
                        .allow_overlap()
                        .priority(Priority::Low),
                ),
        )
        .unwrap();

    let evaluated: usize = (0..21).map(|_| t.tick(0.1).evaluated).sum();
    assert_eq!(evaluated, 3);
}

#[test]
fn test_overflow_is_reported_and_ticks_back_off() {
    let config = EngineConfig {
        workers: WorkersConfig {
            interactive: 1,
            default: 1,
            queue_capacity: 2,
        },
        ..test_config()
    };
    let t = ManualEngine::with_config(EngineConfig {
        saturation_threshold: 0.5,
        ..config
    });
    for name in ["a", "b", "c"] {
        t.engine
            .register(
                EventDefinition::parse(id("mod", name), "true", noop())
                    .unwrap()
                    .with_options(EventOptions::new().continual().allow_overlap()),
            )
            .unwrap();
    }

    let first = t.tick(0.1);
    assert_eq!(first.fired, 2);
    assert_eq!(first.errors, 1);
    let info = t.engine.event_info(&id("mod", "c")).unwrap();
    assert_eq!(info.errors[0].kind, "dispatch_overflow");
    assert_eq!(info.fire_count, 0);

    // nothing drains the queue, so later ticks are skipped
    assert!(t.tick(0.1).skipped);
    let stats = t.engine.stats();
    assert_eq!(stats.overflows, 1);
    assert_eq!(stats.skipped_ticks, 1);
    assert_eq!(stats.saturation, 1.0);
}

#[test]
fn test_script_trigger_reads_namespace_scope() {
    let t = ManualEngine::new();
    let ev = id("house", "hot");
    t.engine
        .register(
            EventDefinition::parse(ev.clone(), "!edgetrigger temp > limit", noop())
                .unwrap()
                .with_options(EventOptions::new().setup("limit = 25; temp = 20")),
        )
        .unwrap();

    assert_eq!(t.tick(0.1).fired, 0);
    let scope = t.engine.scopes().get("house").unwrap();
    scope.set("temp", Value::from(26));
    assert_eq!(t.tick(0.1).fired, 1);
}
