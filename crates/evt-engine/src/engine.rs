//! Engine orchestration
//!
//! The [`Engine`] owns the registry, the worker pools, the timer source and
//! a handle to the message bus, and connects them: the poll loop and the
//! bus and timer callbacks all funnel into one fire path, which checks the
//! enable flag, overlap and rate limit and enqueues the action under the
//! event's own lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use evt_bus::MessageBus;
use evt_core::{
    topics, Clock, EventId, Message, ScopeRegistry, SharedClock, SystemClock, Value,
    ONE_TIME_NAMESPACE,
};
use evt_expr::{Env, Program};
use evt_timer::TimerSource;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, trace, warn};
use ulid::Ulid;

use crate::config::{ConfigResult, EngineConfig};
use crate::dispatch::{Job, JobRunner, WorkerDispatch};
use crate::error::{ActionError, EngineError, EngineResult};
use crate::event::{
    Action, ActionContext, Event, EventDefinition, EventHandle, EventInfo, EventOptions,
    EventRuntime,
};
use crate::poll::PollReport;
use crate::registry::EventRegistry;
use crate::report::{ErrorReporter, ErrorSink};
use crate::stats::{EngineStats, StatsSnapshot};
use crate::trigger::{Condition, TimeTrigger, TriggerSpec};
use crate::trigger_eval::{message_variables, Evaluation, FireVariables, TriggerEvaluator};

/// Result of one fire attempt, decided under the event's lock
pub(crate) enum FireOutcome {
    Dispatched,
    Suppressed(&'static str),
    Failed(EngineError),
}

pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) clock: SharedClock,
    pub(crate) bus: Arc<MessageBus>,
    pub(crate) timers: TimerSource,
    pub(crate) scopes: ScopeRegistry,
    pub(crate) registry: EventRegistry,
    pub(crate) dispatch: WorkerDispatch,
    pub(crate) reporter: Arc<ErrorReporter>,
    pub(crate) stats: Arc<EngineStats>,
    /// Held from the duplicate check until the registry insert
    registering: Mutex<()>,
    running: AtomicBool,
    stopped: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl EngineInner {
    /// Decide whether a triggered event is dispatched and enqueue it
    ///
    /// Called with the event's runtime lock held, so the rate-limit check,
    /// the `last_fired` update and the enqueue are one atomic step.
    pub(crate) fn fire_locked(
        &self,
        event: &Arc<Event>,
        rt: &mut EventRuntime,
        variables: FireVariables,
        message: Option<Message>,
    ) -> FireOutcome {
        if event.is_retired() || !rt.enabled {
            return FireOutcome::Suppressed("disabled");
        }
        let options = event.options();
        if !options.allow_overlap && rt.running > 0 {
            return FireOutcome::Suppressed("overlap");
        }
        let now_mono = self.clock.monotonic();
        if let Some(last) = rt.last_fired {
            if !options.rate_limit.is_zero() && now_mono.saturating_sub(last) < options.rate_limit
            {
                return FireOutcome::Suppressed("rate_limit");
            }
        }

        let now = self.clock.now();
        let ctx = ActionContext::new(
            event.id().clone(),
            now,
            variables,
            message,
            event.scope().clone(),
            self.bus.clone(),
        );
        let job = Job {
            event: event.clone(),
            ctx,
        };
        match self.dispatch.submit(job) {
            Ok(()) => {
                rt.last_fired = Some(rt.last_fired.map_or(now_mono, |last| last.max(now_mono)));
                rt.last_fired_at = Some(now);
                rt.fire_count += 1;
                rt.running += 1;
                if options.once {
                    event.retire();
                }
                FireOutcome::Dispatched
            }
            Err(e) => FireOutcome::Failed(e),
        }
    }

    /// Bookkeeping after the event's lock is released; true if dispatched
    pub(crate) fn finish_fire(&self, event: &Arc<Event>, outcome: FireOutcome) -> bool {
        match outcome {
            FireOutcome::Dispatched => {
                self.stats.record_fire();
                debug!(event = %event.id(), "Event fired");
                if event.options().once {
                    self.unregister(event.handle());
                }
                true
            }
            FireOutcome::Suppressed(reason) => {
                self.stats.record_suppressed();
                trace!(event = %event.id(), reason, "Fire suppressed");
                false
            }
            FireOutcome::Failed(err) => {
                if matches!(err, EngineError::DispatchOverflow { .. }) {
                    self.stats.record_overflow();
                }
                self.reporter.report(event, &err);
                false
            }
        }
    }

    fn register(
        self: &Arc<Self>,
        definition: EventDefinition,
        replace: bool,
    ) -> EngineResult<EventHandle> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(EngineError::Shutdown);
        }
        let registering = self.registering.lock().unwrap_or_else(|e| e.into_inner());
        if !replace && self.registry.contains(&definition.id) {
            return Err(EngineError::DuplicateRegistration(definition.id));
        }

        let namespace = definition.id.namespace().to_string();
        let scope = self.scopes.acquire(&namespace);
        if let Some(setup) = &definition.options.setup {
            let result = Program::parse(setup).and_then(|program| {
                let mut env = Env::with_scope(&scope);
                program.execute(&mut env)
            });
            if let Err(source) = result {
                self.scopes.release(&namespace);
                return Err(EngineError::Script {
                    event: definition.id,
                    source,
                });
            }
        }

        let event = Arc::new(Event::new(
            definition,
            self.registry.next_generation(),
            scope,
        ));
        {
            let mut rt = event.runtime();
            TriggerEvaluator::new(event.scope(), self.clock.now())
                .arm(event.trigger(), &mut rt.trigger);
        }

        let registered = self.registry.register(event.clone(), replace);
        drop(registering);
        match registered {
            Ok(Some(previous)) => self.teardown(&previous),
            Ok(None) => {}
            Err(e) => {
                self.scopes.release(&namespace);
                return Err(e);
            }
        }

        if let Err(e) = self.attach(&event) {
            self.unregister(event.handle());
            return Err(e);
        }

        info!(
            event = %event.id(),
            kind = %event.trigger().kind(),
            priority = %event.options().priority,
            "Registered event"
        );
        Ok(event.handle().clone())
    }

    /// Remove an event if the handle is still current
    pub(crate) fn unregister(&self, handle: &EventHandle) -> bool {
        match self.registry.unregister(handle) {
            Some(event) => {
                self.teardown(&event);
                info!(event = %handle.id(), "Unregistered event");
                true
            }
            None => false,
        }
    }

    /// Retire an event that has left the registry
    fn teardown(&self, event: &Arc<Event>) {
        event.retire();
        self.detach(event);
        self.scopes.release(event.id().namespace());
    }

    fn attach(self: &Arc<Self>, event: &Arc<Event>) -> EngineResult<()> {
        match event.trigger() {
            TriggerSpec::OnMessage(pattern) => {
                let weak = Arc::downgrade(self);
                let target = event.clone();
                let subscription = self.bus.subscribe(pattern.as_str(), move |message| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_message(&target, message);
                    }
                })?;

                let mut attachments = event.attachments();
                if attachments.detached {
                    drop(attachments);
                    self.bus.unsubscribe(subscription);
                } else {
                    attachments.subscription = Some(subscription);
                }
            }
            TriggerSpec::TimeSpec(_) => self.arm_timer(event),
            TriggerSpec::Polled(_) | TriggerSpec::OnChange(_) => {}
        }
        Ok(())
    }

    /// Release the event's bus subscription and timer
    ///
    /// Once this returns no bus or timer callback of the event runs again.
    fn detach(&self, event: &Event) {
        let (subscription, timer) = {
            let mut attachments = event.attachments();
            attachments.detached = true;
            (attachments.subscription.take(), attachments.timer.take())
        };
        if let Some(subscription) = subscription {
            self.bus.unsubscribe(subscription);
        }
        if let Some(timer) = timer {
            self.timers.cancel(timer);
        }
    }

    /// Schedule a wake-up for a time trigger's next instant
    pub(crate) fn arm_timer(self: &Arc<Self>, event: &Arc<Event>) {
        let Some(next) = event.runtime().trigger.next_fire() else {
            return;
        };
        let delay = (next - self.clock.now())
            .to_std()
            .unwrap_or(Duration::ZERO);

        let previous = {
            let mut attachments = event.attachments();
            if attachments.detached {
                return;
            }
            let weak = Arc::downgrade(self);
            let target = event.clone();
            let id = self.timers.after(delay, move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_timer(&target);
                }
            });
            attachments.timer.replace(id)
        };
        if let Some(previous) = previous {
            self.timers.cancel(previous);
        }
        trace!(event = %event.id(), next = %next, "Armed time trigger");
    }

    fn disarm_timer(&self, event: &Event) {
        let timer = event.attachments().timer.take();
        if let Some(timer) = timer {
            self.timers.cancel(timer);
        }
    }

    fn on_timer(self: &Arc<Self>, event: &Arc<Event>) {
        if event.is_retired() {
            return;
        }
        let outcome = {
            let mut rt = event.runtime();
            if !rt.enabled {
                return;
            }
            let evaluator = TriggerEvaluator::new(event.scope(), self.clock.now());
            match evaluator.evaluate(event.trigger(), &mut rt.trigger, false) {
                Evaluation::Fired(vars) => Some(self.fire_locked(event, &mut rt, vars, None)),
                Evaluation::NotFired | Evaluation::Error(_) => None,
            }
        };
        if let Some(outcome) = outcome {
            self.finish_fire(event, outcome);
        }
        self.arm_timer(event);
    }

    fn on_message(&self, event: &Arc<Event>, message: &Message) {
        if event.is_retired() {
            return;
        }
        let outcome = {
            let mut rt = event.runtime();
            self.fire_locked(
                event,
                &mut rt,
                message_variables(message),
                Some(message.clone()),
            )
        };
        self.finish_fire(event, outcome);
    }
}

/// Builder for an [`Engine`] with an injected clock or bus
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    clock: Option<SharedClock>,
    bus: Option<Arc<MessageBus>>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a different time source, e.g. a [`ManualClock`](evt_core::ManualClock)
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Share an existing message bus
    pub fn bus(mut self, bus: Arc<MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn build(self) -> ConfigResult<Engine> {
        self.config.validate()?;
        let config = self.config;
        let clock = self.clock.unwrap_or_else(SystemClock::shared);
        let bus = self.bus.unwrap_or_default();
        let stats = Arc::new(EngineStats::new());
        let reporter = Arc::new(ErrorReporter::new(
            bus.clone(),
            clock.clone(),
            stats.clone(),
            config.errors_to_keep,
            config.post_errors_to_bus,
        ));
        let runner = Arc::new(JobRunner::new(
            clock.clone(),
            reporter.clone(),
            config.history_to_keep,
        ));
        let dispatch = WorkerDispatch::new(&config.workers, runner);
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Engine {
            inner: Arc::new(EngineInner {
                config,
                clock,
                bus,
                timers: TimerSource::new(),
                scopes: ScopeRegistry::new(),
                registry: EventRegistry::new(),
                dispatch,
                reporter,
                stats,
                registering: Mutex::new(()),
                running: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                shutdown_tx,
            }),
        })
    }
}

/// The event engine
///
/// Cheap to clone; clones share the same engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Create an engine with the system clock and a new message bus
    pub fn new(config: EngineConfig) -> ConfigResult<Self> {
        Self::builder().config(config).build()
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn bus(&self) -> Arc<MessageBus> {
        self.inner.bus.clone()
    }

    pub fn clock(&self) -> SharedClock {
        self.inner.clock.clone()
    }

    pub fn timers(&self) -> &TimerSource {
        &self.inner.timers
    }

    /// Namespace scopes shared by the events of each namespace
    pub fn scopes(&self) -> &ScopeRegistry {
        &self.inner.scopes
    }

    /// Start the poll loop, the timer task and the worker pools
    ///
    /// Must be called from within a tokio runtime. A stopped engine cannot
    /// be started again.
    pub fn start(&self) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            warn!("Event engine was stopped and cannot be restarted");
            return;
        }
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("Event engine already running");
            return;
        }

        info!(
            tick_ms = self.inner.config.tick_interval_ms,
            events = self.inner.registry.len(),
            "Starting event engine"
        );
        self.inner.dispatch.start();
        self.inner.timers.start();

        let inner = self.inner.clone();
        let shutdown_rx = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            inner.run_poll_loop(shutdown_rx).await;
        });

        self.inner.bus.publish(
            topics::ENGINE_STARTED,
            json!({ "events": self.inner.registry.len() }),
        );
    }

    /// Stop polling, timers and workers; in-flight actions finish
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping event engine");
        self.inner.running.store(false, Ordering::SeqCst);
        let _ = self.inner.shutdown_tx.send(());
        self.inner.timers.stop();
        self.inner.dispatch.stop();
        self.inner.bus.publish(topics::ENGINE_STOPPED, json!({}));
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Register an event; fails if its identity is taken
    #[instrument(skip(self, definition), fields(event = %definition.id))]
    pub fn register(&self, definition: EventDefinition) -> EngineResult<EventHandle> {
        self.inner.register(definition, false)
    }

    /// Register an event, replacing any event with the same identity
    ///
    /// The replaced event is detached and its runtime state discarded.
    #[instrument(skip(self, definition), fields(event = %definition.id))]
    pub fn register_or_replace(&self, definition: EventDefinition) -> EngineResult<EventHandle> {
        self.inner.register(definition, true)
    }

    /// Unregister by handle
    ///
    /// Idempotent: a handle that was already removed or replaced is a no-op.
    /// A running action is not interrupted.
    #[instrument(skip(self, handle), fields(event = %handle.id()))]
    pub fn unregister(&self, handle: &EventHandle) -> bool {
        self.inner.unregister(handle)
    }

    /// Unregister whatever event holds an identity
    pub fn unregister_id(&self, id: &EventId) -> bool {
        match self.inner.registry.get(id) {
            Some(event) => self.inner.unregister(event.handle()),
            None => false,
        }
    }

    /// Remove every event of a namespace and close its scope
    #[instrument(skip(self))]
    pub fn remove_namespace(&self, namespace: &str) -> usize {
        let removed = self.inner.registry.remove_namespace(namespace);
        for event in &removed {
            self.inner.teardown(event);
        }
        self.inner.scopes.close(namespace);
        info!(namespace, removed = removed.len(), "Removed namespace");
        removed.len()
    }

    /// Pause or resume an event without unregistering it
    pub fn set_enabled(&self, id: &EventId, enabled: bool) -> EngineResult<()> {
        let event = self
            .inner
            .registry
            .get(id)
            .ok_or_else(|| EngineError::NotFound(id.clone()))?;
        {
            let mut rt = event.runtime();
            if rt.enabled == enabled {
                return Ok(());
            }
            rt.enabled = enabled;
            if enabled {
                TriggerEvaluator::new(event.scope(), self.inner.clock.now())
                    .rearm(event.trigger(), &mut rt.trigger);
            }
        }

        if matches!(event.trigger(), TriggerSpec::TimeSpec(_)) {
            if enabled {
                self.inner.arm_timer(&event);
            } else {
                self.inner.disarm_timer(&event);
            }
        }
        info!(event = %id, enabled, "Event enabled state changed");
        Ok(())
    }

    /// Fire an event now through the normal fire path
    ///
    /// Returns whether the action was dispatched; rate limit, overlap and the
    /// enable flag still apply.
    pub fn run_now(&self, id: &EventId) -> EngineResult<bool> {
        let event = self
            .inner
            .registry
            .get(id)
            .ok_or_else(|| EngineError::NotFound(id.clone()))?;
        let mut vars = FireVariables::new();
        vars.insert("manual".to_string(), Value::Bool(true));
        let outcome = {
            let mut rt = event.runtime();
            self.inner.fire_locked(&event, &mut rt, vars, None)
        };
        Ok(self.inner.finish_fire(&event, outcome))
    }

    /// Run `action` once, the first time `predicate` becomes true
    pub fn when<P, A>(&self, predicate: P, action: A) -> EngineResult<EventHandle>
    where
        P: Fn() -> bool + Send + Sync + 'static,
        A: Fn(&mut ActionContext) -> Result<(), ActionError> + Send + Sync + 'static,
    {
        let definition = EventDefinition::new(
            one_time_id()?,
            TriggerSpec::Polled(Condition::native(predicate)),
            Action::native(action),
        )
        .with_options(EventOptions::new().once());
        self.register(definition)
    }

    /// Run `action` once after `delay`
    ///
    /// Unregistering the returned handle before then cancels it.
    pub fn after<A>(&self, delay: Duration, action: A) -> EngineResult<EventHandle>
    where
        A: Fn(&mut ActionContext) -> Result<(), ActionError> + Send + Sync + 'static,
    {
        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| EngineError::invalid_trigger("after", e))?;
        let at = self
            .inner
            .clock
            .now()
            .checked_add_signed(delay)
            .ok_or_else(|| EngineError::invalid_trigger("after", "delay out of range"))?;
        let definition = EventDefinition::new(
            one_time_id()?,
            TriggerSpec::TimeSpec(TimeTrigger::At(at)),
            Action::native(action),
        )
        .with_options(EventOptions::new().once());
        self.register(definition)
    }

    /// Evaluate every due polled event once
    ///
    /// The poll loop calls this every tick; tests drive it directly.
    pub fn poll_once(&self) -> PollReport {
        self.inner.poll_once()
    }

    pub fn event_info(&self, id: &EventId) -> Option<EventInfo> {
        self.inner.registry.get(id).map(|event| event.info())
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.inner.registry.contains(id)
    }

    /// Registered identities in registration order
    pub fn events(&self) -> Vec<EventId> {
        self.inner.registry.ids()
    }

    /// Number of registered events
    pub fn count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner
            .stats
            .snapshot(self.inner.registry.len(), self.inner.dispatch.saturation())
    }

    pub fn add_error_sink(&self, sink: Arc<dyn ErrorSink>) {
        self.inner.reporter.add_sink(sink);
    }
}

fn one_time_id() -> EngineResult<EventId> {
    Ok(EventId::new(ONE_TIME_NAMESPACE, Ulid::new().to_string())?)
}
