//! Error reporting
//!
//! Every evaluation, action and overflow error goes through
//! [`ErrorReporter::report`]: it is logged with the event's identity, kept in
//! the event's error history, optionally published on the bus, and handed to
//! any registered [`ErrorSink`].

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use evt_bus::MessageBus;
use evt_core::{topics, Clock, Context, EventId, SharedClock};
use serde_json::json;
use tracing::{error, warn};

use crate::error::EngineError;
use crate::event::{ErrorRecord, Event};
use crate::stats::EngineStats;

/// Receives every error the engine reports
pub trait ErrorSink: Send + Sync {
    fn report(&self, event: &EventId, error: &EngineError);
}

impl<F> ErrorSink for F
where
    F: Fn(&EventId, &EngineError) + Send + Sync,
{
    fn report(&self, event: &EventId, error: &EngineError) {
        self(event, error)
    }
}

pub struct ErrorReporter {
    bus: Arc<MessageBus>,
    clock: SharedClock,
    stats: Arc<EngineStats>,
    errors_to_keep: usize,
    post_to_bus: bool,
    sinks: RwLock<Vec<Arc<dyn ErrorSink>>>,
}

impl ErrorReporter {
    pub fn new(
        bus: Arc<MessageBus>,
        clock: SharedClock,
        stats: Arc<EngineStats>,
        errors_to_keep: usize,
        post_to_bus: bool,
    ) -> Self {
        Self {
            bus,
            clock,
            stats,
            errors_to_keep,
            post_to_bus,
            sinks: RwLock::new(Vec::new()),
        }
    }

    pub fn add_sink(&self, sink: Arc<dyn ErrorSink>) {
        self.sinks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(sink);
    }

    /// Report an error raised by `event`
    ///
    /// Must not be called with the event's runtime lock held.
    pub fn report(&self, event: &Event, err: &EngineError) {
        let id = event.id();
        match err {
            EngineError::ActionPanicked { .. } | EngineError::DispatchOverflow { .. } => {
                error!(event = %id, kind = err.kind(), "{}", err)
            }
            _ => warn!(event = %id, kind = err.kind(), "{}", err),
        }
        self.stats.record_error();

        let record = ErrorRecord {
            time: self.clock.now(),
            kind: err.kind(),
            message: err.to_string(),
        };
        let first = event.runtime().push_error(record.clone(), self.errors_to_keep);

        if self.post_to_bus {
            let payload = json!({
                "event": id.to_string(),
                "kind": record.kind,
                "message": record.message,
                "time": record.time.to_rfc3339(),
            });
            self.bus.publish_with_context(
                &topics::event_errors(id),
                payload.clone(),
                Context::for_event(id.clone()),
            );
            if first {
                self.bus.publish_with_context(
                    topics::ERROR_NOTIFICATIONS,
                    payload,
                    Context::for_event(id.clone()),
                );
            }
        }

        let sinks = self.sinks.read().unwrap_or_else(|e| e.into_inner()).clone();
        for sink in sinks {
            if catch_unwind(AssertUnwindSafe(|| sink.report(id, err))).is_err() {
                warn!(event = %id, "Error sink panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Action, EventDefinition};
    use crate::trigger::TriggerSpec;
    use evt_core::{ManualClock, Message, Scope};
    use std::sync::Mutex;

    fn event() -> Event {
        let def = EventDefinition::new(
            EventId::new("mod", "ev").unwrap(),
            TriggerSpec::parse("x").unwrap(),
            Action::native(|_| Ok(())),
        );
        Event::new(def, 1, Arc::new(Scope::new("mod")))
    }

    fn failure(event: &Event) -> EngineError {
        EngineError::ActionExecution {
            event: event.id().clone(),
            message: "boom".to_string(),
        }
    }

    #[test]
    fn test_report_posts_and_notifies_first_error_once() {
        let bus = Arc::new(MessageBus::new());
        let (_, mut errors_rx) = bus.subscribe_channel("/system/errors/events/#").unwrap();
        let (_, mut notify_rx) = bus.subscribe_channel(topics::ERROR_NOTIFICATIONS).unwrap();
        let stats = Arc::new(EngineStats::new());
        let reporter = ErrorReporter::new(bus, ManualClock::new().shared(), stats.clone(), 2, true);

        let ev = event();
        for _ in 0..3 {
            reporter.report(&ev, &failure(&ev));
        }

        let mut posted: Vec<Message> = Vec::new();
        while let Ok(msg) = errors_rx.try_recv() {
            posted.push(msg);
        }
        assert_eq!(posted.len(), 3);
        assert_eq!(posted[0].topic, "/system/errors/events/mod/ev");
        assert_eq!(posted[0].payload["kind"], "action_execution");

        assert!(notify_rx.try_recv().is_ok());
        assert!(notify_rx.try_recv().is_err());

        let info = ev.info();
        assert_eq!(info.error_count, 3);
        assert_eq!(info.errors.len(), 2);
        assert_eq!(stats.snapshot(0, 0.0).errors, 3);
    }

    #[test]
    fn test_sinks_receive_errors() {
        let bus = Arc::new(MessageBus::new());
        let reporter = ErrorReporter::new(
            bus.clone(),
            ManualClock::new().shared(),
            Arc::new(EngineStats::new()),
            5,
            false,
        );
        let seen: Arc<Mutex<Vec<String>>> = Arc::default();
        let sink_seen = seen.clone();
        reporter.add_sink(Arc::new(move |id: &EventId, err: &EngineError| {
            sink_seen
                .lock()
                .unwrap()
                .push(format!("{} {}", id, err.kind()));
        }));
        reporter.add_sink(Arc::new(|_: &EventId, _: &EngineError| panic!("bad sink")));

        let (_, mut rx) = bus.subscribe_channel("#").unwrap();
        let ev = event();
        reporter.report(&ev, &failure(&ev));

        assert_eq!(*seen.lock().unwrap(), vec!["mod/ev action_execution"]);
        // bus posting disabled
        assert!(rx.try_recv().is_err());
    }
}
