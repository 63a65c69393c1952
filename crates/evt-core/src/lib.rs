//! Core types for the event engine
//!
//! This crate provides the fundamental types shared by the bus, the timer
//! source and the engine: the typed [`Value`] model, [`EventId`], [`Context`],
//! [`Message`], [`Priority`], the injectable [`Clock`] and the per-namespace
//! variable [`Scope`].

mod clock;
mod context;
mod event_id;
mod message;
mod priority;
mod scope;
mod value;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use context::Context;
pub use event_id::{EventId, EventIdError};
pub use message::Message;
pub use priority::{PoolClass, Priority, PriorityParseError};
pub use scope::{Scope, ScopeRegistry};
pub use value::Value;

/// Namespace used for anonymous events created by `when`/`after` helpers
pub const ONE_TIME_NAMESPACE: &str = "<OneTimeEvents>";

/// Well-known message bus topics used by the engine
pub mod topics {
    use crate::EventId;

    /// Prefix under which per-event errors are posted
    pub const EVENT_ERRORS_PREFIX: &str = "/system/errors/events";

    /// Topic for "needs attention" notifications
    pub const ERROR_NOTIFICATIONS: &str = "/system/notifications/errors";

    /// Topic announcing engine start
    pub const ENGINE_STARTED: &str = "/system/events/started";

    /// Topic announcing engine stop
    pub const ENGINE_STOPPED: &str = "/system/events/stopped";

    /// Topic an event's errors are posted to
    pub fn event_errors(id: &EventId) -> String {
        format!("{}/{}/{}", EVENT_ERRORS_PREFIX, id.namespace(), id.name())
    }
}
