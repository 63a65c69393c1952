//! Pratt parser producing [`Expr`] trees and [`Statement`] lists

use evt_core::Value;

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::lexer::{tokenize, Spanned, Token};
use crate::program::Statement;
use crate::{ExprError, ExprResult};

/// Binding power of `not`; its operand may contain comparisons but not `and`/`or`
const NOT_BP: u8 = 5;
/// Binding power of unary minus
const NEG_BP: u8 = 13;

pub(crate) struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    pub(crate) fn new(src: &str) -> ExprResult<Self> {
        Ok(Self {
            tokens: tokenize(src)?,
            pos: 0,
        })
    }

    /// Parse a single expression, allowing surrounding separators
    pub(crate) fn parse_expression(mut self) -> ExprResult<Expr> {
        self.skip_separators();
        if self.peek() == &Token::Eof {
            return Err(ExprError::syntax(self.position(), "empty expression"));
        }
        let expr = self.expr(0)?;
        self.skip_separators();
        self.expect_eof()?;
        Ok(expr)
    }

    /// Parse a sequence of statements
    pub(crate) fn parse_statements(mut self) -> ExprResult<Vec<Statement>> {
        let mut statements = Vec::new();
        loop {
            self.skip_separators();
            if self.peek() == &Token::Eof {
                break;
            }

            let is_assignment = matches!(self.peek_at(1), Some(Token::Assign));
            let statement = match self.peek().clone() {
                Token::Ident(name) if is_assignment => {
                    self.advance();
                    self.advance();
                    Statement::Assign(name, self.expr(0)?)
                }
                _ => Statement::Expr(self.expr(0)?),
            };
            statements.push(statement);

            match self.peek() {
                Token::Separator | Token::Eof => {}
                other => {
                    return Err(ExprError::syntax(
                        self.position(),
                        format!("expected end of statement, found {:?}", other),
                    ))
                }
            }
        }
        Ok(statements)
    }

    fn expr(&mut self, min_bp: u8) -> ExprResult<Expr> {
        let mut lhs = self.prefix()?;

        loop {
            let (l_bp, r_bp) = match infix_binding_power(self.peek()) {
                Some(bp) => bp,
                None => break,
            };
            if l_bp < min_bp {
                break;
            }

            let op = self.advance().token;
            let rhs = self.expr(r_bp)?;
            lhs = match op {
                Token::And => Expr::And(Box::new(lhs), Box::new(rhs)),
                Token::Or => Expr::Or(Box::new(lhs), Box::new(rhs)),
                other => {
                    let op = binary_op(&other).ok_or_else(|| {
                        ExprError::syntax(self.position(), "expected binary operator")
                    })?;
                    Expr::Binary(op, Box::new(lhs), Box::new(rhs))
                }
            };
        }

        Ok(lhs)
    }

    fn prefix(&mut self) -> ExprResult<Expr> {
        let Spanned { token, position } = self.advance();
        match token {
            Token::Number(n) => Ok(Expr::Literal(Value::Number(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::Not => Ok(Expr::Unary(UnaryOp::Not, Box::new(self.expr(NOT_BP)?))),
            Token::Minus => Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.expr(NEG_BP)?))),
            Token::Plus => self.expr(NEG_BP),
            Token::LParen => {
                let inner = self.expr(0)?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::Ident(name) => {
                if self.peek() == &Token::LParen {
                    self.advance();
                    let args = self.arguments()?;
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Variable(name))
                }
            }
            Token::Eof => Err(ExprError::syntax(position, "unexpected end of expression")),
            other => Err(ExprError::syntax(
                position,
                format!("unexpected token {:?}", other),
            )),
        }
    }

    fn arguments(&mut self) -> ExprResult<Vec<Expr>> {
        let mut args = Vec::new();
        if self.peek() == &Token::RParen {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.expr(0)?);
            match self.advance() {
                Spanned {
                    token: Token::Comma,
                    ..
                } => continue,
                Spanned {
                    token: Token::RParen,
                    ..
                } => break,
                Spanned { position, .. } => {
                    return Err(ExprError::syntax(position, "expected ',' or ')'"))
                }
            }
        }
        Ok(args)
    }

    fn peek(&self) -> &Token {
        self.tokens
            .get(self.pos)
            .map(|s| &s.token)
            .unwrap_or(&Token::Eof)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset).map(|s| &s.token)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map(|s| s.position).unwrap_or(0)
    }

    fn advance(&mut self) -> Spanned {
        let spanned = self.tokens.get(self.pos).cloned().unwrap_or(Spanned {
            token: Token::Eof,
            position: self.position(),
        });
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        spanned
    }

    fn expect(&mut self, token: Token, what: &str) -> ExprResult<()> {
        let position = self.position();
        if self.advance().token == token {
            Ok(())
        } else {
            Err(ExprError::syntax(position, format!("expected {}", what)))
        }
    }

    fn expect_eof(&self) -> ExprResult<()> {
        match self.peek() {
            Token::Eof => Ok(()),
            other => Err(ExprError::syntax(
                self.position(),
                format!("unexpected trailing {:?}", other),
            )),
        }
    }

    fn skip_separators(&mut self) {
        while self.peek() == &Token::Separator {
            self.advance();
        }
    }
}

fn infix_binding_power(token: &Token) -> Option<(u8, u8)> {
    let bp = match token {
        Token::Or => (1, 2),
        Token::And => (3, 4),
        Token::EqEq | Token::NotEq | Token::Lt | Token::Le | Token::Gt | Token::Ge => (7, 8),
        Token::Plus | Token::Minus => (9, 10),
        Token::Star | Token::Slash | Token::Percent => (11, 12),
        _ => return None,
    };
    Some(bp)
}

fn binary_op(token: &Token) -> Option<BinaryOp> {
    Some(match token {
        Token::Plus => BinaryOp::Add,
        Token::Minus => BinaryOp::Sub,
        Token::Star => BinaryOp::Mul,
        Token::Slash => BinaryOp::Div,
        Token::Percent => BinaryOp::Mod,
        Token::EqEq => BinaryOp::Eq,
        Token::NotEq => BinaryOp::NotEq,
        Token::Lt => BinaryOp::Lt,
        Token::Le => BinaryOp::Le,
        Token::Gt => BinaryOp::Gt,
        Token::Ge => BinaryOp::Ge,
        _ => return None,
    })
}
