//! Trigger specifications
//!
//! A trigger string is classified into exactly one of four kinds:
//!
//! | syntax                    | kind        |
//! |---------------------------|-------------|
//! | `!onmsg /topic/#`         | OnMessage   |
//! | `!onchange expr`          | OnChange    |
//! | `!time every day at noon` | TimeSpec    |
//! | `!edgetrigger expr`, `expr` | Polled    |

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use evt_bus::TopicPattern;
use evt_core::Value;
use evt_expr::{evaluate, Env, Expr, ExprResult};
use evt_timer::Schedule;
use serde::Serialize;

use crate::error::{EngineError, EngineResult};

/// A condition supplied as a native closure
pub type NativeCondition = Arc<dyn Fn() -> bool + Send + Sync>;

/// The value a polled or on-change trigger observes
#[derive(Clone)]
pub enum Condition {
    /// Expression evaluated against the event's namespace scope
    Expr { expr: Expr, source: String },
    /// Native predicate
    Native(NativeCondition),
}

impl Condition {
    /// Parse an expression condition
    pub fn parse(source: &str) -> EngineResult<Self> {
        let source = source.trim();
        let expr =
            evt_expr::parse(source).map_err(|e| EngineError::invalid_trigger(source, e))?;
        Ok(Condition::Expr {
            expr,
            source: source.to_string(),
        })
    }

    /// Wrap a native predicate
    pub fn native<F>(predicate: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Condition::Native(Arc::new(predicate))
    }

    pub fn evaluate(&self, env: &Env<'_>) -> ExprResult<Value> {
        match self {
            Condition::Expr { expr, .. } => evaluate(expr, env),
            Condition::Native(predicate) => Ok(Value::Bool(predicate())),
        }
    }

    /// Names of the variables the condition reads
    pub fn variables(&self) -> Vec<String> {
        match self {
            Condition::Expr { expr, .. } => expr.variables().into_iter().collect(),
            Condition::Native(_) => Vec::new(),
        }
    }

    pub fn source(&self) -> &str {
        match self {
            Condition::Expr { source, .. } => source,
            Condition::Native(_) => "<native>",
        }
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Expr { source, .. } => f.debug_tuple("Expr").field(source).finish(),
            Condition::Native(_) => f.write_str("Native"),
        }
    }
}

/// When a time trigger fires
#[derive(Debug, Clone, PartialEq)]
pub enum TimeTrigger {
    /// Calendar schedule
    Schedule(Schedule),
    /// A single instant
    At(DateTime<Utc>),
}

impl TimeTrigger {
    /// The first fire instant strictly after `t`
    pub fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            TimeTrigger::Schedule(schedule) => schedule.next_after(t),
            TimeTrigger::At(at) => (*at > t).then_some(*at),
        }
    }

    /// The first fire instant at or after `t`
    pub fn first_from(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            TimeTrigger::Schedule(schedule) => schedule.next_after(t),
            TimeTrigger::At(at) => Some(*at),
        }
    }

    pub fn is_missed(&self, scheduled: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self {
            TimeTrigger::Schedule(schedule) => schedule.is_missed(scheduled, now),
            TimeTrigger::At(_) => false,
        }
    }
}

impl fmt::Display for TimeTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeTrigger::Schedule(schedule) => write!(f, "{}", schedule),
            TimeTrigger::At(at) => write!(f, "at {}", at.to_rfc3339()),
        }
    }
}

/// Trigger kind, used for introspection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Polled,
    OnChange,
    OnMessage,
    TimeSpec,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TriggerKind::Polled => "polled",
            TriggerKind::OnChange => "on_change",
            TriggerKind::OnMessage => "on_message",
            TriggerKind::TimeSpec => "time_spec",
        };
        f.write_str(name)
    }
}

/// Parsed trigger specification
#[derive(Debug, Clone)]
pub enum TriggerSpec {
    /// Fires on a false to true transition of the condition
    Polled(Condition),
    /// Fires whenever the observed value differs from the previous one
    OnChange(Condition),
    /// Fires when the bus delivers a matching message
    OnMessage(TopicPattern),
    /// Fires on a schedule
    TimeSpec(TimeTrigger),
}

impl TriggerSpec {
    /// Parse a trigger string
    pub fn parse(trigger: &str) -> EngineResult<Self> {
        let trimmed = trigger.trim();
        if trimmed.is_empty() {
            return Err(EngineError::invalid_trigger(trigger, "empty trigger"));
        }

        let Some(directive) = trimmed.strip_prefix('!') else {
            return Ok(TriggerSpec::Polled(Condition::parse(trimmed)?));
        };
        let (keyword, rest) = directive
            .split_once(char::is_whitespace)
            .map(|(k, r)| (k, r.trim()))
            .unwrap_or((directive, ""));
        if rest.is_empty() {
            return Err(EngineError::invalid_trigger(
                trigger,
                format!("'!{}' needs an argument", keyword),
            ));
        }

        match keyword.to_ascii_lowercase().as_str() {
            "onmsg" => Self::on_message(rest),
            "onchange" => Ok(TriggerSpec::OnChange(Condition::parse(rest)?)),
            "time" => Self::time(rest),
            "edgetrigger" => Ok(TriggerSpec::Polled(Condition::parse(rest)?)),
            other => Err(EngineError::invalid_trigger(
                trigger,
                format!("unknown directive '!{}'", other),
            )),
        }
    }

    /// Polled trigger from an expression
    pub fn polled(expr: &str) -> EngineResult<Self> {
        Ok(TriggerSpec::Polled(Condition::parse(expr)?))
    }

    /// On-change trigger from an expression
    pub fn on_change(expr: &str) -> EngineResult<Self> {
        Ok(TriggerSpec::OnChange(Condition::parse(expr)?))
    }

    /// Message trigger for a topic pattern
    pub fn on_message(pattern: &str) -> EngineResult<Self> {
        let pattern =
            TopicPattern::new(pattern).map_err(|e| EngineError::invalid_trigger(pattern, e))?;
        Ok(TriggerSpec::OnMessage(pattern))
    }

    /// Time trigger from a schedule phrase
    pub fn time(schedule: &str) -> EngineResult<Self> {
        let parsed: Schedule = schedule
            .parse()
            .map_err(|e| EngineError::invalid_trigger(schedule, e))?;
        Ok(TriggerSpec::TimeSpec(TimeTrigger::Schedule(parsed)))
    }

    pub fn kind(&self) -> TriggerKind {
        match self {
            TriggerSpec::Polled(_) => TriggerKind::Polled,
            TriggerSpec::OnChange(_) => TriggerKind::OnChange,
            TriggerSpec::OnMessage(_) => TriggerKind::OnMessage,
            TriggerSpec::TimeSpec(_) => TriggerKind::TimeSpec,
        }
    }

    /// Whether the poll loop evaluates this trigger
    pub fn is_polled(&self) -> bool {
        !matches!(self, TriggerSpec::OnMessage(_))
    }
}

impl fmt::Display for TriggerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerSpec::Polled(c) => f.write_str(c.source()),
            TriggerSpec::OnChange(c) => write!(f, "!onchange {}", c.source()),
            TriggerSpec::OnMessage(p) => write!(f, "!onmsg {}", p),
            TriggerSpec::TimeSpec(t) => write!(f, "!time {}", t),
        }
    }
}
