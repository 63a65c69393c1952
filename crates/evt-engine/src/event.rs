//! Events, their options and runtime state

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use evt_bus::{MessageBus, SubscriptionId};
use evt_core::{Context, EventId, Message, Priority, Scope, Value};
use evt_expr::{Env, ExprError, Program};
use evt_timer::TimerId;
use serde::Serialize;

use crate::error::{ActionError, EngineError, EngineResult};
use crate::trigger::{TriggerKind, TriggerSpec};
use crate::trigger_eval::{FireVariables, TriggerState};

/// Native action body
pub type NativeAction = Arc<dyn Fn(&mut ActionContext) -> Result<(), ActionError> + Send + Sync>;

/// What an event runs when it fires
#[derive(Clone)]
pub enum Action {
    Native(NativeAction),
    /// Assignment statements run against the namespace scope
    Script(Arc<Program>),
}

impl Action {
    pub fn native<F>(f: F) -> Self
    where
        F: Fn(&mut ActionContext) -> Result<(), ActionError> + Send + Sync + 'static,
    {
        Action::Native(Arc::new(f))
    }

    pub fn script(source: &str) -> Result<Self, ExprError> {
        Ok(Action::Script(Arc::new(Program::parse(source)?)))
    }

    pub(crate) fn run(&self, ctx: &mut ActionContext) -> EngineResult<()> {
        match self {
            Action::Native(f) => f(ctx).map_err(|e| EngineError::ActionExecution {
                event: ctx.event.clone(),
                message: e.to_string(),
            }),
            Action::Script(program) => {
                let mut env = Env::with_scope(&ctx.scope);
                for (name, value) in &ctx.variables {
                    env.set_local(name.clone(), value.clone());
                }
                program
                    .execute(&mut env)
                    .map(|_| ())
                    .map_err(|source| EngineError::Script {
                        event: ctx.event.clone(),
                        source,
                    })
            }
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Native(_) => f.write_str("Native"),
            Action::Script(p) => f.debug_tuple("Script").field(&p.source()).finish(),
        }
    }
}

/// Everything an action can see when it runs
pub struct ActionContext {
    event: EventId,
    context: Context,
    fired_at: DateTime<Utc>,
    variables: FireVariables,
    message: Option<Message>,
    scope: Arc<Scope>,
    bus: Arc<MessageBus>,
}

impl ActionContext {
    pub(crate) fn new(
        event: EventId,
        fired_at: DateTime<Utc>,
        mut variables: FireVariables,
        message: Option<Message>,
        scope: Arc<Scope>,
        bus: Arc<MessageBus>,
    ) -> Self {
        let context = match &message {
            Some(m) => m.context.child_for_event(event.clone()),
            None => Context::for_event(event.clone()),
        };
        variables.insert("fired_at".to_string(), Value::from(fired_at.to_rfc3339()));
        Self {
            event,
            context,
            fired_at,
            variables,
            message,
            scope,
            bus,
        }
    }

    pub fn event(&self) -> &EventId {
        &self.event
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn fired_at(&self) -> DateTime<Utc> {
        self.fired_at
    }

    /// Look up a trigger variable, then the namespace scope
    pub fn get(&self, name: &str) -> Option<Value> {
        self.variables
            .get(name)
            .cloned()
            .or_else(|| self.scope.get(name))
    }

    pub fn variables(&self) -> &FireVariables {
        &self.variables
    }

    /// The delivered message, for on-message triggers
    pub fn message(&self) -> Option<&Message> {
        self.message.as_ref()
    }

    pub fn topic(&self) -> Option<&str> {
        self.message.as_ref().map(|m| m.topic.as_str())
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Set a variable in the namespace scope
    pub fn set(&self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.scope.set(name, value)
    }

    /// Publish on the bus as a consequence of this action
    pub fn publish(&self, topic: &str, payload: impl Into<serde_json::Value>) -> usize {
        self.bus
            .publish_with_context(topic, payload, self.context.child())
    }
}

/// Per-event registration options
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventOptions {
    /// Minimum time between dispatches; zero disables the limit
    pub rate_limit: Duration,
    pub priority: Priority,
    /// Unregister after the first fire
    pub once: bool,
    /// Polled triggers fire on every true evaluation instead of on edges
    pub continual: bool,
    /// Allow a fire while the previous run is still executing
    pub allow_overlap: bool,
    /// Script run once against the namespace scope at registration
    pub setup: Option<String>,
}

impl EventOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rate_limit(mut self, limit: Duration) -> Self {
        self.rate_limit = limit;
        self
    }

    /// Negative or non-finite values disable the limit
    pub fn rate_limit_secs(self, seconds: f64) -> Self {
        self.rate_limit(Duration::try_from_secs_f64(seconds).unwrap_or_default())
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    pub fn continual(mut self) -> Self {
        self.continual = true;
        self
    }

    pub fn allow_overlap(mut self) -> Self {
        self.allow_overlap = true;
        self
    }

    pub fn setup(mut self, script: impl Into<String>) -> Self {
        self.setup = Some(script.into());
        self
    }
}

/// An event as handed to [`Engine::register`](crate::Engine::register)
#[derive(Debug, Clone)]
pub struct EventDefinition {
    pub id: EventId,
    pub trigger: TriggerSpec,
    pub action: Action,
    pub options: EventOptions,
}

impl EventDefinition {
    pub fn new(id: EventId, trigger: TriggerSpec, action: Action) -> Self {
        Self {
            id,
            trigger,
            action,
            options: EventOptions::default(),
        }
    }

    /// Build a definition from a trigger string
    pub fn parse(id: EventId, trigger: &str, action: Action) -> EngineResult<Self> {
        Ok(Self::new(id, TriggerSpec::parse(trigger)?, action))
    }

    pub fn with_options(mut self, options: EventOptions) -> Self {
        self.options = options;
        self
    }
}

/// Handle returned by registration
///
/// The generation distinguishes two registrations of the same identity, so a
/// stale handle never removes its replacement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventHandle {
    id: EventId,
    generation: u64,
}

impl EventHandle {
    pub(crate) fn new(id: EventId, generation: u64) -> Self {
        Self { id, generation }
    }

    pub fn id(&self) -> &EventId {
        &self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// One recorded error
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub time: DateTime<Utc>,
    pub kind: &'static str,
    pub message: String,
}

/// One recorded action run
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RunRecord {
    pub started: DateTime<Utc>,
    pub completed: DateTime<Utc>,
    pub ok: bool,
}

/// Mutable state guarded by the event's lock
#[derive(Debug)]
pub(crate) struct EventRuntime {
    pub trigger: TriggerState,
    /// Monotonic time of the last accepted fire
    pub last_fired: Option<Duration>,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub next_poll: Duration,
    pub backoff_until: Option<Duration>,
    pub running: usize,
    pub fire_count: u64,
    pub enabled: bool,
    pub errors: VecDeque<ErrorRecord>,
    pub error_count: u64,
    pub history: VecDeque<RunRecord>,
}

impl EventRuntime {
    fn new() -> Self {
        Self {
            trigger: TriggerState::new(),
            last_fired: None,
            last_fired_at: None,
            last_completed_at: None,
            next_poll: Duration::ZERO,
            backoff_until: None,
            running: 0,
            fire_count: 0,
            enabled: true,
            errors: VecDeque::new(),
            error_count: 0,
            history: VecDeque::new(),
        }
    }

    /// Record an error, returning true if it is the event's first
    pub fn push_error(&mut self, record: ErrorRecord, keep: usize) -> bool {
        self.error_count += 1;
        push_bounded(&mut self.errors, record, keep);
        self.error_count == 1
    }

    pub fn push_run(&mut self, record: RunRecord, keep: usize) {
        self.last_completed_at = Some(record.completed);
        push_bounded(&mut self.history, record, keep);
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, keep: usize) {
    if keep == 0 {
        return;
    }
    while queue.len() >= keep {
        queue.pop_front();
    }
    queue.push_back(item);
}

/// Bus and timer registrations owned by an event
#[derive(Debug, Default)]
pub(crate) struct Attachments {
    pub subscription: Option<SubscriptionId>,
    pub timer: Option<TimerId>,
    /// Set once the event has been detached; no new timers are armed after
    pub detached: bool,
}

/// A registered event
pub struct Event {
    handle: EventHandle,
    trigger: TriggerSpec,
    action: Action,
    options: EventOptions,
    scope: Arc<Scope>,
    /// Set when the event leaves the registry; never cleared
    retired: AtomicBool,
    runtime: Mutex<EventRuntime>,
    attachments: Mutex<Attachments>,
}

impl Event {
    pub(crate) fn new(definition: EventDefinition, generation: u64, scope: Arc<Scope>) -> Self {
        let EventDefinition {
            id,
            trigger,
            action,
            options,
        } = definition;
        Self {
            handle: EventHandle::new(id, generation),
            trigger,
            action,
            options,
            scope,
            retired: AtomicBool::new(false),
            runtime: Mutex::new(EventRuntime::new()),
            attachments: Mutex::new(Attachments::default()),
        }
    }

    pub fn id(&self) -> &EventId {
        &self.handle.id
    }

    pub fn handle(&self) -> &EventHandle {
        &self.handle
    }

    pub fn trigger(&self) -> &TriggerSpec {
        &self.trigger
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    pub fn options(&self) -> &EventOptions {
        &self.options
    }

    pub fn scope(&self) -> &Arc<Scope> {
        &self.scope
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Mark as retired, returning false if it already was
    pub(crate) fn retire(&self) -> bool {
        !self.retired.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn runtime(&self) -> MutexGuard<'_, EventRuntime> {
        self.runtime.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn attachments(&self) -> MutexGuard<'_, Attachments> {
        self.attachments.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Point-in-time description of the event
    pub fn info(&self) -> EventInfo {
        let rt = self.runtime();
        EventInfo {
            id: self.id().clone(),
            kind: self.trigger.kind(),
            trigger: self.trigger.to_string(),
            priority: self.options.priority,
            enabled: rt.enabled,
            once: self.options.once,
            continual: self.options.continual,
            rate_limit_secs: self.options.rate_limit.as_secs_f64(),
            last_fired: rt.last_fired_at,
            last_completed: rt.last_completed_at,
            next_fire: rt.trigger.next_fire(),
            fire_count: rt.fire_count,
            running: rt.running,
            error_count: rt.error_count,
            errors: rt.errors.iter().cloned().collect(),
            history: rt.history.iter().copied().collect(),
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", self.id())
            .field("generation", &self.handle.generation)
            .field("trigger", &self.trigger)
            .field("options", &self.options)
            .finish()
    }
}

/// Introspection snapshot of an event
#[derive(Debug, Clone, Serialize)]
pub struct EventInfo {
    pub id: EventId,
    pub kind: TriggerKind,
    pub trigger: String,
    pub priority: Priority,
    pub enabled: bool,
    pub once: bool,
    pub continual: bool,
    pub rate_limit_secs: f64,
    pub last_fired: Option<DateTime<Utc>>,
    pub last_completed: Option<DateTime<Utc>>,
    pub next_fire: Option<DateTime<Utc>>,
    pub fire_count: u64,
    pub running: usize,
    pub error_count: u64,
    pub errors: Vec<ErrorRecord>,
    pub history: Vec<RunRecord>,
}
