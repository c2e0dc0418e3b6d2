//! Generation-time filter predicates.
//!
//! Runbooks can attach `ensure_all` predicates to a template; combinations
//! for which any predicate is false are skipped during generation. The
//! expression language is deliberately small: comparisons, boolean
//! connectives, literals, and variable lookups. Expressions are parsed
//! once at load time and evaluated per combination against the bound
//! variable values.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

/// Errors raised while parsing or evaluating a filter predicate
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    /// The expression text does not match the grammar
    #[error("syntax error in filter '{expr}': {message}")]
    Syntax {
        /// The predicate text
        expr: String,
        /// What went wrong
        message: String,
    },

    /// The expression references a variable absent from the bound values
    #[error("filter references unknown variable '{name}'")]
    UnknownVariable {
        /// The missing variable
        name: String,
    },

    /// Operands have incompatible types for the operator
    #[error("type mismatch in filter: {message}")]
    TypeMismatch {
        /// What went wrong
        message: String,
    },

    /// The predicate evaluated to a non-boolean value
    #[error("filter '{expr}' did not evaluate to a boolean")]
    NotBoolean {
        /// The predicate text
        expr: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Lit(Value),
    AndAnd,
    OrOr,
    Bang,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Lit(Value),
    Var(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A parsed `ensure_all` predicate
#[derive(Debug, Clone, PartialEq)]
pub struct FilterExpr {
    source: String,
    root: Expr,
}

impl FilterExpr {
    /// Parse a predicate
    pub fn parse(source: &str) -> Result<Self, FilterError> {
        let tokens = lex(source)?;
        let mut parser = Parser {
            source,
            tokens,
            pos: 0,
        };
        let root = parser.expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(FilterError::Syntax {
                expr: source.to_string(),
                message: "trailing input after expression".to_string(),
            });
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    /// The predicate text as written in the runbook
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against bound variable values
    pub fn eval(&self, scope: &HashMap<String, Value>) -> Result<bool, FilterError> {
        match eval_expr(&self.root, scope)? {
            Value::Bool(b) => Ok(b),
            _ => Err(FilterError::NotBoolean {
                expr: self.source.clone(),
            }),
        }
    }
}

fn lex(source: &str) -> Result<Vec<Tok>, FilterError> {
    let syntax = |message: String| FilterError::Syntax {
        expr: source.to_string(),
        message,
    };
    let mut tokens = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Tok::RParen);
                i += 1;
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Tok::AndAnd);
                    i += 2;
                } else {
                    return Err(syntax("expected '&&'".to_string()));
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Tok::OrOr);
                    i += 2;
                } else {
                    return Err(syntax("expected '||'".to_string()));
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Tok::EqEq);
                    i += 2;
                } else {
                    return Err(syntax("expected '==' (assignment is not supported)".to_string()));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Tok::NotEq);
                    i += 2;
                } else {
                    tokens.push(Tok::Bang);
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Tok::Le);
                    i += 2;
                } else {
                    tokens.push(Tok::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Tok::Ge);
                    i += 2;
                } else {
                    tokens.push(Tok::Gt);
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut text = String::new();
                let mut j = i + 1;
                loop {
                    match chars.get(j) {
                        Some(&ch) if ch == quote => break,
                        Some(&ch) => {
                            text.push(ch);
                            j += 1;
                        }
                        None => return Err(syntax("unterminated string literal".to_string())),
                    }
                }
                tokens.push(Tok::Lit(Value::String(text)));
                i = j + 1;
            }
            c if c.is_ascii_digit() || (c == '-' && matches!(chars.get(i + 1), Some(d) if d.is_ascii_digit())) => {
                let start = i;
                i += 1;
                let mut is_float = false;
                while let Some(&ch) = chars.get(i) {
                    if ch.is_ascii_digit() {
                        i += 1;
                    } else if ch == '.' && !is_float {
                        is_float = true;
                        i += 1;
                    } else {
                        break;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let value = if is_float {
                    text.parse::<f64>()
                        .ok()
                        .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
                } else {
                    text.parse::<i64>().ok().map(|n| Value::Number(n.into()))
                };
                match value {
                    Some(v) => tokens.push(Tok::Lit(v)),
                    None => return Err(syntax(format!("invalid number '{text}'"))),
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while let Some(&ch) = chars.get(i) {
                    if ch.is_alphanumeric() || ch == '_' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "true" => tokens.push(Tok::Lit(Value::Bool(true))),
                    "false" => tokens.push(Tok::Lit(Value::Bool(false))),
                    "and" => tokens.push(Tok::AndAnd),
                    "or" => tokens.push(Tok::OrOr),
                    "not" => tokens.push(Tok::Bang),
                    _ => tokens.push(Tok::Ident(word)),
                }
            }
            other => return Err(syntax(format!("unexpected character '{other}'"))),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Tok>,
    pos: usize,
}

impl Parser<'_> {
    fn syntax(&self, message: impl Into<String>) -> FilterError {
        FilterError::Syntax {
            expr: self.source.to_string(),
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expr(&mut self) -> Result<Expr, FilterError> {
        let mut lhs = self.and_expr()?;
        while self.peek() == Some(&Tok::OrOr) {
            self.bump();
            let rhs = self.and_expr()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, FilterError> {
        let mut lhs = self.unary()?;
        while self.peek() == Some(&Tok::AndAnd) {
            self.bump();
            let rhs = self.unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, FilterError> {
        if self.peek() == Some(&Tok::Bang) {
            self.bump();
            let inner = self.unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, FilterError> {
        let lhs = self.operand()?;
        let op = match self.peek() {
            Some(Tok::EqEq) => CmpOp::Eq,
            Some(Tok::NotEq) => CmpOp::Ne,
            Some(Tok::Lt) => CmpOp::Lt,
            Some(Tok::Le) => CmpOp::Le,
            Some(Tok::Gt) => CmpOp::Gt,
            Some(Tok::Ge) => CmpOp::Ge,
            _ => return Ok(lhs),
        };
        self.bump();
        let rhs = self.operand()?;
        Ok(Expr::Cmp(op, Box::new(lhs), Box::new(rhs)))
    }

    fn operand(&mut self) -> Result<Expr, FilterError> {
        match self.bump() {
            Some(Tok::Lit(value)) => Ok(Expr::Lit(value)),
            Some(Tok::Ident(name)) => Ok(Expr::Var(name)),
            Some(Tok::LParen) => {
                let inner = self.expr()?;
                match self.bump() {
                    Some(Tok::RParen) => Ok(inner),
                    _ => Err(self.syntax("expected ')'")),
                }
            }
            Some(tok) => Err(self.syntax(format!("unexpected token {tok:?}"))),
            None => Err(self.syntax("unexpected end of expression")),
        }
    }
}

fn eval_expr(expr: &Expr, scope: &HashMap<String, Value>) -> Result<Value, FilterError> {
    match expr {
        Expr::Lit(value) => Ok(value.clone()),
        Expr::Var(name) => scope
            .get(name)
            .cloned()
            .ok_or_else(|| FilterError::UnknownVariable { name: name.clone() }),
        Expr::Not(inner) => match eval_expr(inner, scope)? {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            other => Err(FilterError::TypeMismatch {
                message: format!("'!' requires a boolean, got {other}"),
            }),
        },
        Expr::And(lhs, rhs) => {
            if !eval_bool(lhs, scope, "&&")? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(eval_bool(rhs, scope, "&&")?))
        }
        Expr::Or(lhs, rhs) => {
            if eval_bool(lhs, scope, "||")? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(eval_bool(rhs, scope, "||")?))
        }
        Expr::Cmp(op, lhs, rhs) => {
            let lhs = eval_expr(lhs, scope)?;
            let rhs = eval_expr(rhs, scope)?;
            compare(*op, &lhs, &rhs).map(Value::Bool)
        }
    }
}

fn eval_bool(expr: &Expr, scope: &HashMap<String, Value>, op: &str) -> Result<bool, FilterError> {
    match eval_expr(expr, scope)? {
        Value::Bool(b) => Ok(b),
        other => Err(FilterError::TypeMismatch {
            message: format!("'{op}' requires boolean operands, got {other}"),
        }),
    }
}

fn compare(op: CmpOp, lhs: &Value, rhs: &Value) -> Result<bool, FilterError> {
    // Equality is defined across all value types; integers and floats
    // representing the same quantity compare equal.
    match op {
        CmpOp::Eq => return Ok(values_equal(lhs, rhs)),
        CmpOp::Ne => return Ok(!values_equal(lhs, rhs)),
        _ => {}
    }
    let ordering = match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
            a.partial_cmp(&b).ok_or_else(|| FilterError::TypeMismatch {
                message: "cannot order NaN".to_string(),
            })?
        }
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (a, b) => {
            return Err(FilterError::TypeMismatch {
                message: format!("cannot order {a} against {b}"),
            })
        }
    };
    Ok(match op {
        CmpOp::Lt => ordering.is_lt(),
        CmpOp::Le => ordering.is_le(),
        CmpOp::Gt => ordering.is_gt(),
        CmpOp::Ge => ordering.is_ge(),
        CmpOp::Eq | CmpOp::Ne => unreachable!("handled above"),
    })
}

fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    if let (Value::Number(a), Value::Number(b)) = (lhs, rhs) {
        return a.as_f64() == b.as_f64();
    }
    lhs == rhs
}
