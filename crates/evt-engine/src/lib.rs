//! Event engine
//!
//! Evaluates trigger expressions against namespace scopes and dispatches the
//! matching actions to bounded worker pools:
//!
//! - polled triggers (`temp > 30`) fire on a false to true edge, or on every
//!   true evaluation when `continual`
//! - on-change triggers (`!onchange level`) fire when the observed value changes
//! - message triggers (`!onmsg /sensors/#`) fire on bus delivery
//! - time triggers (`!time every day at 7:30am`) fire on a calendar schedule
//!
//! ```no_run
//! use evt_core::EventId;
//! use evt_engine::{Action, Engine, EngineConfig, EventDefinition, EventOptions};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::new(EngineConfig::default())?;
//! let id = EventId::new("lights", "too_hot")?;
//! let def = EventDefinition::parse(id, "temp > 30", Action::script("fan = true")?)?
//!     .with_options(EventOptions::new().rate_limit_secs(60.0));
//! engine.register(def)?;
//! engine.start();
//! # Ok(())
//! # }
//! ```

mod config;
mod dispatch;
mod engine;
mod error;
mod event;
mod poll;
mod registry;
mod report;
mod stats;
mod trigger;
mod trigger_eval;

pub use config::{ConfigError, ConfigResult, EngineConfig, PriorityTable, WorkersConfig};
pub use dispatch::WorkerDispatch;
pub use engine::{Engine, EngineBuilder};
pub use error::{ActionError, EngineError, EngineResult};
pub use event::{
    Action, ActionContext, ErrorRecord, Event, EventDefinition, EventHandle, EventInfo,
    EventOptions, NativeAction, RunRecord,
};
pub use poll::PollReport;
pub use registry::EventRegistry;
pub use report::{ErrorReporter, ErrorSink};
pub use stats::{EngineStats, StatsSnapshot};
pub use trigger::{Condition, NativeCondition, TimeTrigger, TriggerKind, TriggerSpec};
pub use trigger_eval::{
    message_variables, Evaluation, FireVariables, TriggerEvaluator, TriggerState,
};
