//! Error types for the event engine

use evt_bus::BusError;
use evt_core::{EventId, EventIdError, PoolClass};
use evt_expr::ExprError;
use evt_timer::TimerError;
use thiserror::Error;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Error returned by a native action body
pub type ActionError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised by the engine
///
/// Evaluation, action and overflow errors are never returned to the poll
/// loop's callers; they are reported through the error sink with the
/// event's identity and only affect the event that raised them.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// A trigger expression failed to evaluate; the event is treated as not fired
    #[error("trigger of {event} failed to evaluate: {source}")]
    ExpressionEvaluation {
        event: EventId,
        #[source]
        source: ExprError,
    },

    /// An action body returned an error
    #[error("action of {event} failed: {message}")]
    ActionExecution { event: EventId, message: String },

    /// An action body panicked
    #[error("action of {event} panicked: {message}")]
    ActionPanicked { event: EventId, message: String },

    /// An event with the same identity is already registered
    #[error("event {0} is already registered")]
    DuplicateRegistration(EventId),

    /// The worker queue was full; the fire was dropped
    #[error("{pool:?} worker queue is full, dropped fire of {event}")]
    DispatchOverflow { event: EventId, pool: PoolClass },

    /// The trigger string could not be parsed
    #[error("invalid trigger '{trigger}': {message}")]
    InvalidTrigger { trigger: String, message: String },

    /// A script action or setup script could not be parsed or failed
    #[error("script error in {event}: {source}")]
    Script {
        event: EventId,
        #[source]
        source: ExprError,
    },

    /// No event with this identity is registered
    #[error("event {0} not found")]
    NotFound(EventId),

    /// An event identity could not be built
    #[error(transparent)]
    InvalidEventId(#[from] EventIdError),

    /// The engine is stopped and cannot accept work
    #[error("engine is shut down")]
    Shutdown,

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Timer(#[from] TimerError),
}

impl EngineError {
    pub(crate) fn invalid_trigger(trigger: &str, message: impl ToString) -> Self {
        EngineError::InvalidTrigger {
            trigger: trigger.to_string(),
            message: message.to_string(),
        }
    }

    /// The event this error belongs to, if any
    pub fn event(&self) -> Option<&EventId> {
        match self {
            EngineError::ExpressionEvaluation { event, .. }
            | EngineError::ActionExecution { event, .. }
            | EngineError::ActionPanicked { event, .. }
            | EngineError::DispatchOverflow { event, .. }
            | EngineError::Script { event, .. } => Some(event),
            EngineError::DuplicateRegistration(event) | EngineError::NotFound(event) => {
                Some(event)
            }
            _ => None,
        }
    }

    /// Short machine-readable name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::ExpressionEvaluation { .. } => "expression_evaluation",
            EngineError::ActionExecution { .. } => "action_execution",
            EngineError::ActionPanicked { .. } => "action_panicked",
            EngineError::DuplicateRegistration(_) => "duplicate_registration",
            EngineError::DispatchOverflow { .. } => "dispatch_overflow",
            EngineError::InvalidTrigger { .. } => "invalid_trigger",
            EngineError::Script { .. } => "script",
            EngineError::NotFound(_) => "not_found",
            EngineError::InvalidEventId(_) => "invalid_event_id",
            EngineError::Shutdown => "shutdown",
            EngineError::Bus(_) => "bus",
            EngineError::Timer(_) => "timer",
        }
    }
}
