//! Embedded expression language for the event engine
//!
//! Trigger conditions and action scripts are written in a small language
//! evaluated over [`evt_core::Value`]:
//!
//! - literals: `1`, `2.5`, `1e3`, `'text'`, `"text"`, `true`, `false`, `null`
//! - logic: `or` / `||`, `and` / `&&`, `not` / `!`
//! - comparison: `== != < <= > >=` (equality is type-strict)
//! - arithmetic: `+ - * / %` (`+` concatenates when either side is a string)
//! - functions: `abs`, `min`, `max`, `round`, `floor`, `len`, `str`, `num`,
//!   `bool`, `defined(name)`
//!
//! Identifiers resolve from local variables, then from the namespace
//! [`evt_core::Scope`]. Scripts ([`Program`]) are `name = expr` statements
//! separated by `;` or newlines.
//!
//! # Example
//!
//! ```
//! use evt_core::{Scope, Value};
//! use evt_expr::{parse, Env};
//!
//! let scope = Scope::new("lights");
//! scope.set("brightness", 80);
//!
//! let expr = parse("brightness > 50 and not night").unwrap();
//! let env = Env::with_scope(&scope).local("night", false);
//! assert_eq!(evt_expr::evaluate(&expr, &env).unwrap(), Value::Bool(true));
//! ```

mod ast;
mod error;
mod eval;
mod lexer;
mod parser;
mod program;

pub use ast::{BinaryOp, Expr, UnaryOp};
pub use error::{ExprError, ExprResult};
pub use eval::{evaluate, Env};
pub use program::{Program, Statement};

/// Parse a single expression
pub fn parse(source: &str) -> ExprResult<Expr> {
    let expr = parser::Parser::new(source)?.parse_expression()?;
    tracing::trace!(source, "Parsed expression");
    Ok(expr)
}
