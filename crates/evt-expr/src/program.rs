//! Action scripts: sequences of assignments and expressions

use evt_core::Value;
use std::collections::BTreeSet;

use crate::ast::Expr;
use crate::eval::{evaluate, Env};
use crate::parser::Parser;
use crate::ExprResult;

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// `name = expr`
    Assign(String, Expr),
    /// A bare expression, evaluated for its errors only
    Expr(Expr),
}

/// A parsed script
///
/// Statements are separated by `;` or newlines and run in order. `#` starts
/// a comment.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    source: String,
    statements: Vec<Statement>,
}

impl Program {
    pub fn parse(source: &str) -> ExprResult<Self> {
        let statements = Parser::new(source)?.parse_statements()?;
        Ok(Self {
            source: source.to_string(),
            statements,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Names the script assigns to
    pub fn assigned_names(&self) -> BTreeSet<String> {
        self.statements
            .iter()
            .filter_map(|s| match s {
                Statement::Assign(name, _) => Some(name.clone()),
                Statement::Expr(_) => None,
            })
            .collect()
    }

    /// Run the script, stopping at the first failing statement
    ///
    /// Returns the value of the last statement.
    pub fn execute(&self, env: &mut Env<'_>) -> ExprResult<Value> {
        let mut last = Value::Null;
        for statement in &self.statements {
            match statement {
                Statement::Assign(name, expr) => {
                    let value = evaluate(expr, env)?;
                    env.assign(name, value.clone());
                    last = value;
                }
                Statement::Expr(expr) => {
                    last = evaluate(expr, env)?;
                }
            }
        }
        Ok(last)
    }
}
