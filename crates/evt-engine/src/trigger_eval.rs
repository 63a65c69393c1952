//! Trigger evaluation
//!
//! Turns a trigger specification plus its per-event [`TriggerState`] into a
//! tri-state [`Evaluation`]. The evaluator never dispatches anything itself;
//! rate limiting, overlap and enable checks belong to the fire path.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use evt_core::{Message, Scope, Value};
use evt_expr::{Env, ExprError};
use tracing::{debug, trace};

use crate::trigger::{Condition, TimeTrigger, TriggerSpec};

/// Variables handed to the action when a trigger fires
pub type FireVariables = HashMap<String, Value>;

/// Outcome of evaluating a trigger once
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Fired(FireVariables),
    NotFired,
    Error(ExprError),
}

impl Evaluation {
    pub fn is_fired(&self) -> bool {
        matches!(self, Evaluation::Fired(_))
    }
}

/// Per-event memory the evaluator needs between evaluations
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriggerState {
    /// Truthiness at the last successful polled evaluation
    previous: Option<bool>,
    /// Last observed on-change value
    baseline: Option<Value>,
    /// Next instant a time trigger is due
    next_fire: Option<DateTime<Utc>>,
}

impl TriggerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn previous(&self) -> Option<bool> {
        self.previous
    }

    pub fn baseline(&self) -> Option<&Value> {
        self.baseline.as_ref()
    }

    pub fn next_fire(&self) -> Option<DateTime<Utc>> {
        self.next_fire
    }
}

/// Evaluates triggers against a namespace scope at a point in time
pub struct TriggerEvaluator<'a> {
    scope: &'a Scope,
    now: DateTime<Utc>,
}

impl<'a> TriggerEvaluator<'a> {
    pub fn new(scope: &'a Scope, now: DateTime<Utc>) -> Self {
        Self { scope, now }
    }

    /// Prepare state for a freshly registered trigger
    ///
    /// On-change triggers capture their baseline here; an error leaves the
    /// baseline unset so the first successful evaluation captures it instead.
    pub fn arm(&self, trigger: &TriggerSpec, state: &mut TriggerState) {
        *state = TriggerState::default();
        match trigger {
            TriggerSpec::Polled(_) | TriggerSpec::OnMessage(_) => {}
            TriggerSpec::OnChange(condition) => {
                state.baseline = self.observe(condition).ok();
            }
            TriggerSpec::TimeSpec(time) => {
                state.next_fire = time.first_from(self.now);
            }
        }
    }

    /// Recapture state when a disabled event is enabled again
    ///
    /// A polled trigger that is already true must go false before it can
    /// fire, and time occurrences that passed while disabled are skipped.
    pub fn rearm(&self, trigger: &TriggerSpec, state: &mut TriggerState) {
        match trigger {
            TriggerSpec::Polled(condition) => {
                state.previous = self.observe(condition).ok().map(|v| v.is_truthy());
            }
            TriggerSpec::OnChange(condition) => {
                state.baseline = self.observe(condition).ok();
            }
            TriggerSpec::TimeSpec(time) => {
                state.next_fire = time.next_after(self.now);
            }
            TriggerSpec::OnMessage(_) => {}
        }
    }

    /// Evaluate a trigger, updating its state
    ///
    /// `continual` makes a polled trigger level-triggered.
    pub fn evaluate(
        &self,
        trigger: &TriggerSpec,
        state: &mut TriggerState,
        continual: bool,
    ) -> Evaluation {
        match trigger {
            TriggerSpec::Polled(condition) => self.eval_polled(condition, state, continual),
            TriggerSpec::OnChange(condition) => self.eval_on_change(condition, state),
            TriggerSpec::TimeSpec(time) => self.eval_time(time, state),
            // pushed by the message bus
            TriggerSpec::OnMessage(_) => Evaluation::NotFired,
        }
    }

    fn observe(&self, condition: &Condition) -> Result<Value, ExprError> {
        condition.evaluate(&Env::with_scope(self.scope))
    }

    fn eval_polled(
        &self,
        condition: &Condition,
        state: &mut TriggerState,
        continual: bool,
    ) -> Evaluation {
        let env = Env::with_scope(self.scope);
        let value = match condition.evaluate(&env) {
            Ok(value) => value,
            Err(e) => return Evaluation::Error(e),
        };

        let is_true = value.is_truthy();
        let was_true = state.previous.replace(is_true) == Some(true);
        if !is_true || (was_true && !continual) {
            return Evaluation::NotFired;
        }

        let mut vars = referenced_variables(condition, &env);
        vars.insert("value".to_string(), value);
        Evaluation::Fired(vars)
    }

    fn eval_on_change(&self, condition: &Condition, state: &mut TriggerState) -> Evaluation {
        let env = Env::with_scope(self.scope);
        let value = match condition.evaluate(&env) {
            Ok(value) => value,
            Err(e) => return Evaluation::Error(e),
        };

        match state.baseline.replace(value.clone()) {
            None => {
                trace!(value = %value, "captured on-change baseline");
                Evaluation::NotFired
            }
            Some(previous) if previous != value => {
                let mut vars = referenced_variables(condition, &env);
                vars.insert("value".to_string(), value);
                vars.insert("previous".to_string(), previous);
                Evaluation::Fired(vars)
            }
            Some(_) => Evaluation::NotFired,
        }
    }

    fn eval_time(&self, time: &TimeTrigger, state: &mut TriggerState) -> Evaluation {
        let Some(due) = state.next_fire else {
            return Evaluation::NotFired;
        };
        if self.now < due {
            return Evaluation::NotFired;
        }

        state.next_fire = time.next_after(self.now);
        if time.is_missed(due, self.now) {
            debug!(scheduled = %due, now = %self.now, "time trigger missed its exact window");
            return Evaluation::NotFired;
        }

        let mut vars = FireVariables::new();
        vars.insert("scheduled".to_string(), Value::from(due.to_rfc3339()));
        Evaluation::Fired(vars)
    }
}

/// Variables for a message delivered to an on-message trigger
pub fn message_variables(message: &Message) -> FireVariables {
    let mut vars = FireVariables::new();
    vars.insert("topic".to_string(), Value::from(message.topic.as_str()));
    vars.insert("message".to_string(), Value::from(message.payload.clone()));
    vars
}

fn referenced_variables(condition: &Condition, env: &Env<'_>) -> FireVariables {
    condition
        .variables()
        .into_iter()
        .filter_map(|name| env.resolve(&name).map(|value| (name, value)))
        .collect()
}
