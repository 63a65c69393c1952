//! Expression evaluation over [`Value`]

use evt_core::{Scope, Value};
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::{ExprError, ExprResult};

/// Variable environment an expression is evaluated in
///
/// Names resolve from the local variables first, then from the namespace
/// scope if one is attached.
#[derive(Debug, Default)]
pub struct Env<'a> {
    locals: HashMap<String, Value>,
    scope: Option<&'a Scope>,
}

impl<'a> Env<'a> {
    /// An environment with no variables at all
    pub fn new() -> Self {
        Self::default()
    }

    /// An environment reading from a namespace scope
    pub fn with_scope(scope: &'a Scope) -> Self {
        Self {
            locals: HashMap::new(),
            scope: Some(scope),
        }
    }

    /// Add a local variable; locals shadow scope variables
    pub fn set_local(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.locals.insert(name.into(), value.into());
    }

    /// Builder form of [`Env::set_local`]
    pub fn local(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_local(name, value);
        self
    }

    pub fn resolve(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.locals.get(name) {
            return Some(v.clone());
        }
        self.scope.and_then(|s| s.get(name))
    }

    /// Assign a variable
    ///
    /// Writes go to the namespace scope; a local of the same name is updated
    /// as well so later reads see the new value. Without a scope the
    /// variable becomes a local.
    pub fn assign(&mut self, name: &str, value: Value) {
        match self.scope {
            Some(scope) => {
                if let Some(local) = self.locals.get_mut(name) {
                    *local = value.clone();
                }
                scope.set(name, value);
            }
            None => {
                self.locals.insert(name.to_string(), value);
            }
        }
    }

    pub fn scope(&self) -> Option<&'a Scope> {
        self.scope
    }
}

/// Evaluate an expression
pub fn evaluate(expr: &Expr, env: &Env<'_>) -> ExprResult<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Variable(name) => env
            .resolve(name)
            .ok_or_else(|| ExprError::UndefinedVariable { name: name.clone() }),
        Expr::Unary(UnaryOp::Not, inner) => Ok(Value::Bool(!evaluate(inner, env)?.is_truthy())),
        Expr::Unary(UnaryOp::Neg, inner) => match evaluate(inner, env)? {
            Value::Number(n) => Ok(Value::Number(-n)),
            other => Err(ExprError::invalid_argument(
                "unary -",
                format!("expected number, got {}", other.type_name()),
            )),
        },
        Expr::And(l, r) => {
            if !evaluate(l, env)?.is_truthy() {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(evaluate(r, env)?.is_truthy()))
        }
        Expr::Or(l, r) => {
            if evaluate(l, env)?.is_truthy() {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(evaluate(r, env)?.is_truthy()))
        }
        Expr::Binary(op, l, r) => {
            let left = evaluate(l, env)?;
            let right = evaluate(r, env)?;
            binary(*op, left, right)
        }
        Expr::Call(name, args) => call(name, args, env),
    }
}

fn binary(op: BinaryOp, left: Value, right: Value) -> ExprResult<Value> {
    let mismatch = |left: &Value, right: &Value| ExprError::TypeMismatch {
        op: op.symbol(),
        left: left.type_name(),
        right: right.type_name(),
    };

    match op {
        BinaryOp::Eq => Ok(Value::Bool(left == right)),
        BinaryOp::NotEq => Ok(Value::Bool(left != right)),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match (&left, &right) {
                (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => return Err(mismatch(&left, &right)),
            };
            let result = match ordering {
                // NaN compares false with everything
                None => false,
                Some(ord) => match op {
                    BinaryOp::Lt => ord == Ordering::Less,
                    BinaryOp::Le => ord != Ordering::Greater,
                    BinaryOp::Gt => ord == Ordering::Greater,
                    _ => ord != Ordering::Less,
                },
            };
            Ok(Value::Bool(result))
        }
        BinaryOp::Add => match (&left, &right) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
            (Value::String(_), _) | (_, Value::String(_)) => {
                Ok(Value::String(format!("{}{}", left, right)))
            }
            _ => Err(mismatch(&left, &right)),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            let (a, b) = match (&left, &right) {
                (Value::Number(a), Value::Number(b)) => (*a, *b),
                _ => return Err(mismatch(&left, &right)),
            };
            let n = match op {
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div if b == 0.0 => return Err(ExprError::DivisionByZero),
                BinaryOp::Div => a / b,
                BinaryOp::Mod if b == 0.0 => return Err(ExprError::DivisionByZero),
                // result takes the sign of the divisor
                _ => a - b * (a / b).floor(),
            };
            Ok(Value::Number(n))
        }
    }
}

fn call(name: &str, args: &[Expr], env: &Env<'_>) -> ExprResult<Value> {
    if name == "defined" {
        return match args {
            [Expr::Variable(var)] => Ok(Value::Bool(env.resolve(var).is_some())),
            [arg] => match evaluate(arg, env)? {
                Value::String(var) => Ok(Value::Bool(env.resolve(&var).is_some())),
                other => Err(ExprError::invalid_argument(
                    name,
                    format!("expected a name, got {}", other.type_name()),
                )),
            },
            _ => Err(arity(name, "1", args.len())),
        };
    }

    let values = args
        .iter()
        .map(|a| evaluate(a, env))
        .collect::<ExprResult<Vec<Value>>>()?;

    match name {
        "abs" => Ok(Value::Number(one_number(name, &values)?.abs())),
        "floor" => Ok(Value::Number(one_number(name, &values)?.floor())),
        "round" => match values.as_slice() {
            [v] => Ok(Value::Number(number_arg(name, v)?.round())),
            [v, digits] => {
                let factor = 10f64.powi(number_arg(name, digits)? as i32);
                Ok(Value::Number((number_arg(name, v)? * factor).round() / factor))
            }
            _ => Err(arity(name, "1 or 2", values.len())),
        },
        "min" | "max" => {
            if values.is_empty() {
                return Err(arity(name, "at least 1", 0));
            }
            let mut best = number_arg(name, &values[0])?;
            for v in &values[1..] {
                let n = number_arg(name, v)?;
                best = if name == "min" { best.min(n) } else { best.max(n) };
            }
            Ok(Value::Number(best))
        }
        "len" => match values.as_slice() {
            [Value::String(s)] => Ok(Value::Number(s.chars().count() as f64)),
            [other] => Err(ExprError::invalid_argument(
                name,
                format!("expected string, got {}", other.type_name()),
            )),
            _ => Err(arity(name, "1", values.len())),
        },
        "str" => match values.as_slice() {
            [v] => Ok(Value::String(v.to_string())),
            _ => Err(arity(name, "1", values.len())),
        },
        "bool" => match values.as_slice() {
            [v] => Ok(Value::Bool(v.is_truthy())),
            _ => Err(arity(name, "1", values.len())),
        },
        "num" => match values.as_slice() {
            [Value::Number(n)] => Ok(Value::Number(*n)),
            [Value::Bool(b)] => Ok(Value::Number(if *b { 1.0 } else { 0.0 })),
            [Value::String(s)] => s.trim().parse::<f64>().map(Value::Number).map_err(|_| {
                ExprError::invalid_argument(name, format!("'{}' is not a number", s))
            }),
            [Value::Null] => Err(ExprError::invalid_argument(name, "null is not a number")),
            _ => Err(arity(name, "1", values.len())),
        },
        _ => Err(ExprError::UnknownFunction {
            name: name.to_string(),
        }),
    }
}

fn one_number(function: &str, values: &[Value]) -> ExprResult<f64> {
    match values {
        [v] => number_arg(function, v),
        _ => Err(arity(function, "1", values.len())),
    }
}

fn number_arg(function: &str, value: &Value) -> ExprResult<f64> {
    value.as_f64().ok_or_else(|| {
        ExprError::invalid_argument(
            function,
            format!("expected number, got {}", value.type_name()),
        )
    })
}

fn arity(function: &str, expected: &str, got: usize) -> ExprError {
    ExprError::Arity {
        function: function.to_string(),
        expected: expected.to_string(),
        got,
    }
}
