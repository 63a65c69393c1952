//! Tokenizer

use crate::{ExprError, ExprResult};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    LParen,
    RParen,
    Comma,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Assign,
    /// Statement separator: `;` or a newline outside parentheses
    Separator,
    Eof,
}

/// A token with the byte offset it starts at
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Spanned {
    pub token: Token,
    pub position: usize,
}

pub(crate) fn tokenize(src: &str) -> ExprResult<Vec<Spanned>> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut tokens = Vec::new();
    let mut depth = 0usize;
    let mut i = 0;

    while i < chars.len() {
        let (pos, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);

        let single = |token| Spanned {
            token,
            position: pos,
        };

        match c {
            '\n' => {
                if depth == 0 {
                    tokens.push(single(Token::Separator));
                }
                i += 1;
            }
            c if c.is_whitespace() => i += 1,
            '#' => {
                // comment to end of line
                while i < chars.len() && chars[i].1 != '\n' {
                    i += 1;
                }
            }
            ';' => {
                tokens.push(single(Token::Separator));
                i += 1;
            }
            '(' => {
                depth += 1;
                tokens.push(single(Token::LParen));
                i += 1;
            }
            ')' => {
                depth = depth.saturating_sub(1);
                tokens.push(single(Token::RParen));
                i += 1;
            }
            ',' => {
                tokens.push(single(Token::Comma));
                i += 1;
            }
            '+' => {
                tokens.push(single(Token::Plus));
                i += 1;
            }
            '-' => {
                tokens.push(single(Token::Minus));
                i += 1;
            }
            '*' => {
                tokens.push(single(Token::Star));
                i += 1;
            }
            '/' => {
                tokens.push(single(Token::Slash));
                i += 1;
            }
            '%' => {
                tokens.push(single(Token::Percent));
                i += 1;
            }
            '=' if next == Some('=') => {
                tokens.push(single(Token::EqEq));
                i += 2;
            }
            '=' => {
                tokens.push(single(Token::Assign));
                i += 1;
            }
            '!' if next == Some('=') => {
                tokens.push(single(Token::NotEq));
                i += 2;
            }
            '!' => {
                tokens.push(single(Token::Not));
                i += 1;
            }
            '<' if next == Some('=') => {
                tokens.push(single(Token::Le));
                i += 2;
            }
            '<' => {
                tokens.push(single(Token::Lt));
                i += 1;
            }
            '>' if next == Some('=') => {
                tokens.push(single(Token::Ge));
                i += 2;
            }
            '>' => {
                tokens.push(single(Token::Gt));
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(single(Token::And));
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(single(Token::Or));
                i += 2;
            }
            '\'' | '"' => {
                let (s, consumed) = lex_string(&chars[i..], pos)?;
                tokens.push(single(Token::Str(s)));
                i += consumed;
            }
            c if c.is_ascii_digit()
                || (c == '.' && next.is_some_and(|n| n.is_ascii_digit())) =>
            {
                let (n, consumed) = lex_number(&chars[i..], pos)?;
                tokens.push(single(Token::Number(n)));
                i += consumed;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].1.is_alphanumeric() || chars[i].1 == '_' || chars[i].1 == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().map(|(_, c)| *c).collect();
                let token = match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "true" | "True" => Token::True,
                    "false" | "False" => Token::False,
                    "null" | "None" => Token::Null,
                    _ => Token::Ident(word),
                };
                tokens.push(single(token));
            }
            other => {
                return Err(ExprError::syntax(
                    pos,
                    format!("unexpected character '{}'", other),
                ));
            }
        }
    }

    tokens.push(Spanned {
        token: Token::Eof,
        position: src.len(),
    });
    Ok(tokens)
}

fn lex_string(chars: &[(usize, char)], start: usize) -> ExprResult<(String, usize)> {
    let quote = chars[0].1;
    let mut out = String::new();
    let mut i = 1;
    while i < chars.len() {
        let c = chars[i].1;
        if c == quote {
            return Ok((out, i + 1));
        }
        if c == '\\' {
            let escaped = chars
                .get(i + 1)
                .map(|(_, c)| *c)
                .ok_or_else(|| ExprError::syntax(start, "unterminated string"))?;
            out.push(match escaped {
                'n' => '\n',
                't' => '\t',
                other => other,
            });
            i += 2;
        } else {
            out.push(c);
            i += 1;
        }
    }
    Err(ExprError::syntax(start, "unterminated string"))
}

fn lex_number(chars: &[(usize, char)], start: usize) -> ExprResult<(f64, usize)> {
    let mut i = 0;
    let mut text = String::new();
    let mut seen_dot = false;
    let mut seen_exp = false;

    while i < chars.len() {
        let c = chars[i].1;
        if c.is_ascii_digit() {
            text.push(c);
        } else if c == '.' && !seen_dot && !seen_exp {
            seen_dot = true;
            text.push(c);
        } else if (c == 'e' || c == 'E') && !seen_exp && !text.is_empty() {
            let sign_or_digit = chars.get(i + 1).map(|(_, c)| *c);
            match sign_or_digit {
                Some(d) if d.is_ascii_digit() => {
                    seen_exp = true;
                    text.push(c);
                }
                Some('+') | Some('-')
                    if chars.get(i + 2).is_some_and(|(_, d)| d.is_ascii_digit()) =>
                {
                    seen_exp = true;
                    text.push(c);
                    text.push(chars[i + 1].1);
                    i += 1;
                }
                _ => break,
            }
        } else {
            break;
        }
        i += 1;
    }

    text.parse::<f64>()
        .map(|n| (n, i))
        .map_err(|_| ExprError::syntax(start, format!("invalid number '{}'", text)))
}
