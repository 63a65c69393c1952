//! A running engine: real clock, poll loop, workers, bus and timers

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{counter, id, per_event_counter, wait_for};
use evt_core::{topics, EventId, Value};
use evt_engine::{
    Action, Engine, EngineConfig, EngineError, EventDefinition, EventOptions, WorkersConfig,
};

fn started() -> Engine {
    let engine = Engine::new(EngineConfig::default()).unwrap();
    engine.start();
    engine
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_message_trigger_receives_topic_and_payload() {
    let engine = started();
    let seen: Arc<Mutex<Vec<(Option<Value>, Option<Value>)>>> = Arc::default();
    let s = seen.clone();
    let action = Action::native(move |ctx| {
        s.lock()
            .unwrap()
            .push((ctx.get("topic"), ctx.get("message")));
        Ok(())
    });
    let handle = engine
        .register(EventDefinition::parse(id("mod", "listener"), "!onmsg /test", action).unwrap())
        .unwrap();

    let bus = engine.bus();
    bus.publish("/other", "ignored");
    bus.publish("/test", "poo");
    assert!(wait_for(|| seen.lock().unwrap().len() == 1).await);
    assert_eq!(
        seen.lock().unwrap()[0],
        (Some(Value::from("/test")), Some(Value::from("poo")))
    );

    assert!(engine.unregister(&handle));
    assert!(!bus.has_subscribers("/test"));
    bus.publish("/test", "late");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(seen.lock().unwrap().len(), 1);
    engine.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_script_action_sets_scope_from_message() {
    let engine = started();
    let action = Action::script("last = message; hits = hits + 1").unwrap();
    engine
        .register(
            EventDefinition::parse(id("mod", "script"), "!onmsg /sensors/#", action)
                .unwrap()
                .with_options(EventOptions::new().setup("hits = 0")),
        )
        .unwrap();

    engine.bus().publish("/sensors/kitchen", 21.5);
    let scope = engine.scopes().get("mod").unwrap();
    assert!(wait_for(|| scope.get("hits") == Some(Value::from(1))).await);
    assert_eq!(scope.get("last"), Some(Value::from(21.5)));
    engine.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_once_action_is_still_removed_and_reported() {
    let engine = started();
    let (_, mut errors) = engine
        .bus()
        .subscribe_channel("/system/errors/events/#")
        .unwrap();

    let ev = id("mod", "fails");
    engine
        .register(
            EventDefinition::parse(ev.clone(), "true", Action::native(|_| Err("boom".into())))
                .unwrap()
                .with_options(EventOptions::new().once()),
        )
        .unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(2), errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.topic, topics::event_errors(&ev));
    assert_eq!(msg.payload["kind"], "action_execution");
    assert!(msg.payload["message"].as_str().unwrap().contains("boom"));
    assert!(!engine.contains(&ev));
    engine.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panicking_action_does_not_affect_other_events() {
    let engine = started();
    let kinds: Arc<Mutex<Vec<&'static str>>> = Arc::default();
    let k = kinds.clone();
    engine.add_error_sink(Arc::new(move |_: &EventId, err: &EngineError| {
        k.lock().unwrap().push(err.kind());
    }));

    let (count, healthy) = counter();
    engine
        .register(
            EventDefinition::parse(
                id("mod", "panics"),
                "!onmsg /go",
                Action::native(|_| panic!("action blew up")),
            )
            .unwrap(),
        )
        .unwrap();
    engine
        .register(EventDefinition::parse(id("mod", "healthy"), "!onmsg /go", healthy).unwrap())
        .unwrap();

    engine.bus().publish("/go", true);
    assert!(wait_for(|| count.load(Ordering::SeqCst) == 1).await);
    assert!(wait_for(|| kinds.lock().unwrap().contains(&"action_panicked")).await);

    // both runs finished, so the overlap guard lets them fire again
    let panics = id("mod", "panics");
    let idle = |ev: &EventId| engine.event_info(ev).unwrap().running == 0;
    assert!(wait_for(|| idle(&panics) && idle(&id("mod", "healthy"))).await);
    engine.bus().publish("/go", true);
    assert!(wait_for(|| count.load(Ordering::SeqCst) == 2).await);
    assert!(wait_for(|| kinds.lock().unwrap().len() == 2).await);
    assert_eq!(engine.event_info(&panics).unwrap().fire_count, 2);
    engine.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_register_and_unregister_while_running() {
    let config = EngineConfig {
        workers: WorkersConfig {
            queue_capacity: 2000,
            ..WorkersConfig::default()
        },
        ..EngineConfig::default()
    };
    let engine = Engine::new(config).unwrap();
    engine.start();
    let (counts, action) = per_event_counter();

    let kept: Vec<EventId> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|thread| {
                let engine = engine.clone();
                let action = action.clone();
                s.spawn(move || {
                    let mut kept = Vec::new();
                    for n in 0..125 {
                        let ev = id("load", &format!("t{}_{}", thread, n));
                        let def =
                            EventDefinition::parse(ev.clone(), "true", action.clone()).unwrap();
                        let handle = engine.register(def).unwrap();
                        if n % 2 == 0 {
                            assert!(engine.unregister(&handle));
                        } else {
                            kept.push(ev);
                        }
                    }
                    kept
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect()
    });

    assert_eq!(kept.len(), 8 * 62);
    assert_eq!(engine.count(), 8 * 62);
    let registered: HashSet<EventId> = engine.events().into_iter().collect();
    assert_eq!(registered, kept.iter().cloned().collect::<HashSet<_>>());

    assert!(
        wait_for(|| {
            let counts = counts.lock().unwrap();
            kept.iter().all(|ev| counts.get(ev) == Some(&1))
        })
        .await
    );
    // edge triggers fire once however often they are polled
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(counts.lock().unwrap().values().all(|&n| n <= 1));
    assert_eq!(engine.scopes().ref_count("load"), 8 * 62);
    engine.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_after_runs_once_and_can_be_cancelled() {
    let engine = started();
    let runs = Arc::new(AtomicUsize::new(0));

    let r = runs.clone();
    engine
        .after(Duration::from_millis(30), move |_| {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    assert!(wait_for(|| runs.load(Ordering::SeqCst) == 1).await);
    assert!(wait_for(|| engine.count() == 0).await);

    let r = runs.clone();
    let handle = engine
        .after(Duration::from_millis(100), move |_| {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    assert!(engine.unregister(&handle));
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(engine.timers().pending(), 0);
    engine.stop();
}

#[tokio::test]
async fn test_remove_namespace_detaches_everything() {
    let engine = Engine::new(EngineConfig::default()).unwrap();
    let noop = || Action::native(|_| Ok(()));
    let subscriptions = engine.bus().subscription_count();

    for (name, trigger) in [
        ("msg", "!onmsg /plugin/#"),
        ("clock", "!time every second"),
        ("poll", "x > 1"),
    ] {
        engine
            .register(EventDefinition::parse(id("plugin", name), trigger, noop()).unwrap())
            .unwrap();
    }
    engine
        .register(EventDefinition::parse(id("other", "stays"), "y", noop()).unwrap())
        .unwrap();

    assert_eq!(engine.bus().subscription_count(), subscriptions + 1);
    assert_eq!(engine.timers().pending(), 1);
    assert_eq!(engine.scopes().ref_count("plugin"), 3);

    assert_eq!(engine.remove_namespace("plugin"), 3);
    assert_eq!(engine.events(), vec![id("other", "stays")]);
    assert_eq!(engine.bus().subscription_count(), subscriptions);
    assert_eq!(engine.timers().pending(), 0);
    assert!(engine.scopes().get("plugin").is_none());
    assert!(engine.scopes().get("other").is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_and_stop_are_announced() {
    let engine = Engine::new(EngineConfig::default()).unwrap();
    let (_, mut rx) = engine.bus().subscribe_channel("/system/events/#").unwrap();

    engine.start();
    assert!(engine.is_running());
    engine.stop();
    assert!(!engine.is_running());
    // a stopped engine stays stopped
    engine.start();
    assert!(!engine.is_running());

    assert_eq!(rx.recv().await.unwrap().topic, topics::ENGINE_STARTED);
    assert_eq!(rx.recv().await.unwrap().topic, topics::ENGINE_STOPPED);
    assert!(rx.try_recv().is_err());

    let late = EventDefinition::parse(id("mod", "late"), "x", Action::native(|_| Ok(()))).unwrap();
    assert!(matches!(engine.register(late), Err(EngineError::Shutdown)));
}

#[tokio::test(start_paused = true)]
async fn test_poll_loop_applies_rate_limit_in_paused_time() {
    let engine = Engine::new(EngineConfig::default()).unwrap();
    engine
        .register(
            EventDefinition::parse(id("mod", "heartbeat"), "true", Action::native(|_| Ok(())))
                .unwrap()
                .with_options(
                    EventOptions::new()
                        .continual()
                        .allow_overlap()
                        .rate_limit_secs(1.0),
                ),
        )
        .unwrap();
    engine.start();

    // fires at 0s, 1s, 2s and 3s
    tokio::time::sleep(Duration::from_millis(3500)).await;
    let stats = engine.stats();
    assert_eq!(stats.fires, 4);
    assert!(stats.ticks >= 300);
    assert!(stats.suppressed > 0);
    engine.stop();
}
