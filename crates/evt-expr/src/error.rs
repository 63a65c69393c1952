//! Error types for expression parsing and evaluation

use thiserror::Error;

/// Result type for expression operations
pub type ExprResult<T> = Result<T, ExprError>;

/// Errors that can occur while parsing or evaluating an expression
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExprError {
    /// Invalid expression syntax
    #[error("syntax error at {position}: {message}")]
    Syntax { position: usize, message: String },

    /// Identifier not found in locals or namespace scope
    #[error("undefined variable: {name}")]
    UndefinedVariable { name: String },

    /// Call of an unknown function
    #[error("unknown function: {name}")]
    UnknownFunction { name: String },

    /// Operator applied to unsupported operand types
    #[error("type error: cannot apply '{op}' to {left} and {right}")]
    TypeMismatch {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },

    /// Division or modulo by zero
    #[error("division by zero")]
    DivisionByZero,

    /// Wrong number of arguments to a function
    #[error("{function} takes {expected} argument(s), got {got}")]
    Arity {
        function: String,
        expected: String,
        got: usize,
    },

    /// Invalid argument to function
    #[error("invalid argument to {function}: {message}")]
    InvalidArgument { function: String, message: String },}

impl ExprError {
    pub(crate) fn syntax(position: usize, message: impl Into<String>) -> Self {
        ExprError::Syntax {
            position,
            message: message.into(),
        }
    }

    pub(crate) fn invalid_argument(function: &str, message: impl Into<String>) -> Self {
        ExprError::InvalidArgument {
            function: function.to_string(),
            message: message.into(),
        }
    }
}
