//! Event priority classes

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error for an unrecognised priority name
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown priority '{0}'")]
pub struct PriorityParseError(pub String);

/// Priority class of an event
///
/// The priority decides how often a polled event is evaluated, how long it
/// backs off after an evaluation error, and which worker pool runs its action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Realtime,
    #[default]
    Interactive,
    High,
    Medium,
    Low,
    Verylow,
}

/// Worker pool an action is executed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolClass {
    /// Low-latency pool for realtime and interactive events
    Interactive,
    /// Pool for everything else
    Default,
}

impl Priority {
    pub const ALL: [Priority; 6] = [
        Priority::Realtime,
        Priority::Interactive,
        Priority::High,
        Priority::Medium,
        Priority::Low,
        Priority::Verylow,
    ];

    /// Map a legacy numeric priority; `1` always meant realtime
    pub fn from_legacy(level: u32) -> Self {
        match level {
            0 | 1 => Priority::Realtime,
            2 => Priority::Interactive,
            3 => Priority::High,
            4 => Priority::Medium,
            5 => Priority::Low,
            _ => Priority::Verylow,
        }
    }

    /// The worker pool this priority dispatches to
    pub fn pool(&self) -> PoolClass {
        match self {
            Priority::Realtime | Priority::Interactive => PoolClass::Interactive,
            _ => PoolClass::Default,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Realtime => "realtime",
            Priority::Interactive => "interactive",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
            Priority::Verylow => "verylow",
        }
    }
}

impl FromStr for Priority {
    type Err = PriorityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_lowercase();
        if let Ok(level) = lowered.parse::<u32>() {
            return Ok(Self::from_legacy(level));
        }
        match lowered.as_str() {
            "realtime" => Ok(Priority::Realtime),
            "interactive" => Ok(Priority::Interactive),
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            "verylow" | "very_low" => Ok(Priority::Verylow),
            _ => Err(PriorityParseError(s.to_string())),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
