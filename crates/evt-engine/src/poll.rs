//! Poll loop
//!
//! Every tick takes a snapshot of the registry and evaluates each polled,
//! on-change and time event that is due. Each event is polled at most once
//! per `priority_response[priority]` and skipped for
//! `error_backoff[priority]` after an evaluation error. When the worker
//! queues are fuller than `saturation_threshold` the whole tick is skipped.

use std::sync::Arc;

use evt_core::Clock;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace};

use crate::engine::{EngineInner, FireOutcome};
use crate::error::EngineError;
use crate::trigger_eval::{Evaluation, TriggerEvaluator};

/// What one tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Events whose trigger was evaluated
    pub evaluated: usize,
    /// Events dispatched to a worker
    pub fired: usize,
    /// Evaluation errors and dropped fires
    pub errors: usize,
    /// The tick was skipped for back-pressure
    pub skipped: bool,
}

impl EngineInner {
    pub(crate) fn poll_once(&self) -> PollReport {
        let now_mono = self.clock.monotonic();
        let now = self.clock.now();
        self.stats.record_tick(now_mono);

        let saturation = self.dispatch.saturation();
        if saturation > self.config.saturation_threshold {
            self.stats.record_skipped_tick();
            debug!(saturation, "Worker queues saturated, skipping tick");
            return PollReport {
                skipped: true,
                ..PollReport::default()
            };
        }

        let mut report = PollReport::default();
        for event in self.registry.snapshot() {
            if !event.trigger().is_polled() || event.is_retired() {
                continue;
            }
            let priority = event.options().priority;

            let (outcome, error) = {
                let mut rt = event.runtime();
                if !rt.enabled {
                    continue;
                }
                if let Some(until) = rt.backoff_until {
                    if now_mono < until {
                        continue;
                    }
                    rt.backoff_until = None;
                }
                if now_mono < rt.next_poll {
                    continue;
                }
                rt.next_poll =
                    now_mono.saturating_add(self.config.priority_response.get(priority));
                report.evaluated += 1;

                let evaluator = TriggerEvaluator::new(event.scope(), now);
                match evaluator.evaluate(event.trigger(), &mut rt.trigger, event.options().continual)
                {
                    Evaluation::Fired(vars) => {
                        (Some(self.fire_locked(&event, &mut rt, vars, None)), None)
                    }
                    Evaluation::NotFired => (None, None),
                    Evaluation::Error(source) => {
                        rt.backoff_until = Some(
                            now_mono.saturating_add(self.config.error_backoff.get(priority)),
                        );
                        let err = EngineError::ExpressionEvaluation {
                            event: event.id().clone(),
                            source,
                        };
                        (None, Some(err))
                    }
                }
            };

            if let Some(outcome) = outcome {
                let failed = matches!(outcome, FireOutcome::Failed(_));
                if self.finish_fire(&event, outcome) {
                    report.fired += 1;
                } else if failed {
                    report.errors += 1;
                }
            }
            if let Some(err) = error {
                report.errors += 1;
                self.reporter.report(&event, &err);
            }
        }

        trace!(
            evaluated = report.evaluated,
            fired = report.fired,
            "Poll tick"
        );
        report
    }

    pub(crate) async fn run_poll_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(tick = ?self.config.tick_interval(), "Poll loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once();
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        info!("Poll loop stopped");
    }
}
