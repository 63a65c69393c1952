//! Timer source and calendar schedules for the event engine
//!
//! - [`TimerSource`]: one-shot, absolute-deadline and recurring timers served
//!   by a single tokio task, with a cancel-then-never-fires guarantee.
//! - [`Schedule`]: time-spec phrases (`every day at midnight in utc`,
//!   `every 5 minutes`, `every friday at 5pm exact`) and calendar-aware
//!   next-instant computation.

mod schedule;
mod source;

pub use schedule::{Schedule, ScheduleKind, Unit, Zone, DEFAULT_EXACT_TOLERANCE};
pub use source::{TimerCallback, TimerId, TimerSource};

use thiserror::Error;

/// Errors from the timer source
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TimerError {
    #[error("recurring timer interval must be greater than zero")]
    ZeroInterval,
}

/// Result type for timer operations
pub type TimerResult<T> = Result<T, TimerError>;

/// Errors from parsing a schedule
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ScheduleError {
    #[error("unrecognized schedule '{0}'")]
    Unrecognized(String),

    #[error("invalid time of day '{0}'")]
    InvalidTime(String),

    #[error("invalid time zone '{0}'")]
    InvalidZone(String),

    #[error("step {step} is out of range for {unit:?}")]
    InvalidStep { step: u32, unit: Unit },

    #[error("schedule pattern failed to compile: {0}")]
    Pattern(regex::Error),
}
