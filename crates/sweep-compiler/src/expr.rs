//! Arithmetic for `derived_parameters`.
//!
//! Precedence, lowest to highest:
//!
//! 1. `+`, `-` (left)
//! 2. `*`, `/`, `%` (left)
//! 3. unary `-`, `+`
//! 4. `**`, `^` (right; binds tighter than a unary minus on its left)
//!
//! Integers stay integers under `+ - * %` and integer powers; `/` always
//! yields a float.

use serde_json::{Map, Number, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    /// Identifier not present in the context yet; callers may retry later.
    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),
    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },
    #[error("{0}")]
    Eval(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    pub fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }

    pub fn to_value(self) -> Result<Value, ExprError> {
        match self {
            Num::Int(i) => Ok(Value::Number(i.into())),
            Num::Float(f) => Number::from_f64(f)
                .map(Value::Number)
                .ok_or_else(|| ExprError::Eval(format!("result {} is not finite", f))),
        }
    }

    fn from_value(name: &str, value: &Value) -> Result<Num, ExprError> {
        match value {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Num::Int(i))
                } else {
                    n.as_f64()
                        .map(Num::Float)
                        .ok_or_else(|| ExprError::Eval(format!("'{}' is out of range", name)))
                }
            }
            Value::Bool(b) => Ok(Num::Int(i64::from(*b))),
            other => Err(ExprError::Eval(format!(
                "'{}' is not numeric (found {})",
                name, other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(Num),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Pow,
    LParen,
    RParen,
    Comma,
}

fn tokenize(src: &str) -> Result<Vec<(usize, Token)>, ExprError> {
    let bytes = src.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        let start = i;
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                i += 1;
                continue;
            }
            '+' => out.push((start, Token::Plus)),
            '-' => out.push((start, Token::Minus)),
            '*' if bytes.get(i + 1) == Some(&b'*') => {
                i += 1;
                out.push((start, Token::Pow));
            }
            '*' => out.push((start, Token::Star)),
            '/' => out.push((start, Token::Slash)),
            '%' => out.push((start, Token::Percent)),
            '^' => out.push((start, Token::Pow)),
            '(' => out.push((start, Token::LParen)),
            ')' => out.push((start, Token::RParen)),
            ',' => out.push((start, Token::Comma)),
            c if c.is_ascii_digit() || c == '.' => {
                let mut end = i;
                let mut is_float = false;
                while end < bytes.len() {
                    let d = bytes[end] as char;
                    if d.is_ascii_digit() {
                        end += 1;
                    } else if d == '.' {
                        is_float = true;
                        end += 1;
                    } else if (d == 'e' || d == 'E')
                        && end + 1 < bytes.len()
                        && (bytes[end + 1].is_ascii_digit()
                            || ((bytes[end + 1] == b'-' || bytes[end + 1] == b'+')
                                && end + 2 < bytes.len()
                                && bytes[end + 2].is_ascii_digit()))
                    {
                        is_float = true;
                        end += 2;
                    } else {
                        break;
                    }
                }
                let text = &src[start..end];
                let num = if is_float {
                    text.parse::<f64>().map(Num::Float).ok()
                } else {
                    text.parse::<i64>().map(Num::Int).ok()
                };
                let num = num.ok_or_else(|| ExprError::Syntax {
                    offset: start,
                    message: format!("invalid number '{}'", text),
                })?;
                out.push((start, Token::Num(num)));
                i = end;
                continue;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut end = i;
                while end < bytes.len() {
                    let d = bytes[end] as char;
                    if d.is_ascii_alphanumeric() || d == '_' || d == '.' {
                        end += 1;
                    } else {
                        break;
                    }
                }
                out.push((start, Token::Ident(src[start..end].to_string())));
                i = end;
                continue;
            }
            other => {
                return Err(ExprError::Syntax {
                    offset: start,
                    message: format!("unexpected character '{}'", other),
                })
            }
        }
        i += 1;
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Num(Num),
    Var(String),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Assoc {
    Left,
    Right,
}

fn binary_op_info(token: &Token) -> Option<(u8, Assoc, BinOp)> {
    match token {
        Token::Plus => Some((10, Assoc::Left, BinOp::Add)),
        Token::Minus => Some((10, Assoc::Left, BinOp::Sub)),
        Token::Star => Some((20, Assoc::Left, BinOp::Mul)),
        Token::Slash => Some((20, Assoc::Left, BinOp::Div)),
        Token::Percent => Some((20, Assoc::Left, BinOp::Mod)),
        Token::Pow => Some((40, Assoc::Right, BinOp::Pow)),
        _ => None,
    }
}

const UNARY_PREC: u8 = 30;

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    len: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|(o, _)| *o).unwrap_or(self.len)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        tok
    }

    fn error(&self, message: impl Into<String>) -> ExprError {
        ExprError::Syntax {
            offset: self.offset(),
            message: message.into(),
        }
    }

    fn parse_pratt(&mut self, min_prec: u8) -> Result<Expr, ExprError> {
        let mut left = self.parse_prefix()?;
        while let Some(token) = self.peek() {
            let Some((prec, assoc, op)) = binary_op_info(token) else {
                break;
            };
            if prec < min_prec {
                break;
            }
            self.advance();
            let next_prec = if assoc == Assoc::Left { prec + 1 } else { prec };
            let right = self.parse_pratt(next_prec)?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_prefix(&mut self) -> Result<Expr, ExprError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.advance();
                let operand = self.parse_pratt(UNARY_PREC)?;
                Ok(Expr::Neg(Box::new(operand)))
            }
            Some(Token::Plus) => {
                self.advance();
                self.parse_pratt(UNARY_PREC)
            }
            _ => self.parse_atom(),
        }
    }

    fn parse_atom(&mut self) -> Result<Expr, ExprError> {
        match self.advance() {
            Some(Token::Num(n)) => Ok(Expr::Num(n)),
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.advance();
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.parse_pratt(0)?);
                            match self.peek() {
                                Some(Token::Comma) => {
                                    self.advance();
                                }
                                _ => break,
                            }
                        }
                    }
                    self.expect_rparen()?;
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Var(name))
                }
            }
            Some(Token::LParen) => {
                let inner = self.parse_pratt(0)?;
                self.expect_rparen()?;
                Ok(inner)
            }
            Some(other) => {
                self.pos -= 1;
                Err(self.error(format!("unexpected token {:?}", other)))
            }
            None => Err(self.error("unexpected end of expression")),
        }
    }

    fn expect_rparen(&mut self) -> Result<(), ExprError> {
        match self.advance() {
            Some(Token::RParen) => Ok(()),
            _ => {
                self.pos -= 1;
                Err(self.error("expected ')'"))
            }
        }
    }
}

fn lookup<'a>(context: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = context.get(parts.next()?)?;
    for part in parts {
        current = current.get(part)?;
    }
    Some(current)
}

fn eval(expr: &Expr, context: &Map<String, Value>) -> Result<Num, ExprError> {
    match expr {
        Expr::Num(n) => Ok(*n),
        Expr::Var(name) => match lookup(context, name) {
            Some(v) => Num::from_value(name, v),
            None => Err(ExprError::UnknownIdentifier(name.clone())),
        },
        Expr::Neg(inner) => Ok(match eval(inner, context)? {
            Num::Int(i) => i
                .checked_neg()
                .map(Num::Int)
                .unwrap_or(Num::Float(-(i as f64))),
            Num::Float(f) => Num::Float(-f),
        }),
        Expr::Binary(op, l, r) => {
            let a = eval(l, context)?;
            let b = eval(r, context)?;
            apply(*op, a, b)
        }
        Expr::Call(name, args) => {
            let values = args
                .iter()
                .map(|a| eval(a, context))
                .collect::<Result<Vec<_>, _>>()?;
            call(name, &values)
        }
    }
}

/// Remainder taking the sign of the divisor. `y` must be non-zero.
fn floor_mod(x: i64, y: i64) -> i64 {
    // Only `i64::MIN % -1` wraps, and its remainder is 0.
    let r = x.wrapping_rem(y);
    if r != 0 && (r < 0) != (y < 0) {
        r + y
    } else {
        r
    }
}

fn apply(op: BinOp, a: Num, b: Num) -> Result<Num, ExprError> {
    use Num::{Float, Int};
    let out = match (op, a, b) {
        (BinOp::Add, Int(x), Int(y)) => x.checked_add(y).map(Int),
        (BinOp::Sub, Int(x), Int(y)) => x.checked_sub(y).map(Int),
        (BinOp::Mul, Int(x), Int(y)) => x.checked_mul(y).map(Int),
        (BinOp::Mod, Int(_), Int(0)) | (BinOp::Div, _, Int(0)) => {
            return Err(ExprError::Eval("division by zero".to_string()))
        }
        (BinOp::Mod, Int(x), Int(y)) => Some(Int(floor_mod(x, y))),
        (BinOp::Pow, Int(x), Int(y)) if y >= 0 => u32::try_from(y)
            .ok()
            .and_then(|y| x.checked_pow(y))
            .map(Int),
        _ => None,
    };
    if let Some(n) = out {
        return Ok(n);
    }
    let (x, y) = (a.as_f64(), b.as_f64());
    let f = match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div => {
            if y == 0.0 {
                return Err(ExprError::Eval("division by zero".to_string()));
            }
            x / y
        }
        BinOp::Mod => {
            if y == 0.0 {
                return Err(ExprError::Eval("division by zero".to_string()));
            }
            x - y * (x / y).floor()
        }
        BinOp::Pow => x.powf(y),
    };
    Ok(Float(f))
}

fn call(name: &str, args: &[Num]) -> Result<Num, ExprError> {
    let arity = |n: usize| -> Result<(), ExprError> {
        if args.len() == n {
            Ok(())
        } else {
            Err(ExprError::Eval(format!(
                "{}() takes {} argument(s), got {}",
                name,
                n,
                args.len()
            )))
        }
    };
    match name {
        "sqrt" => {
            arity(1)?;
            Ok(Num::Float(args[0].as_f64().sqrt()))
        }
        "exp" => {
            arity(1)?;
            Ok(Num::Float(args[0].as_f64().exp()))
        }
        "log" => {
            arity(1)?;
            Ok(Num::Float(args[0].as_f64().ln()))
        }
        "abs" => {
            arity(1)?;
            Ok(match args[0] {
                Num::Int(i) => Num::Int(i.saturating_abs()),
                Num::Float(f) => Num::Float(f.abs()),
            })
        }
        "pow" => {
            arity(2)?;
            apply(BinOp::Pow, args[0], args[1])
        }
        "min" | "max" => {
            if args.is_empty() {
                return Err(ExprError::Eval(format!("{}() needs at least one argument", name)));
            }
            let mut best = args[0];
            for &candidate in &args[1..] {
                let better = if name == "min" {
                    candidate.as_f64() < best.as_f64()
                } else {
                    candidate.as_f64() > best.as_f64()
                };
                if better {
                    best = candidate;
                }
            }
            Ok(best)
        }
        other => Err(ExprError::Eval(format!("unknown function '{}'", other))),
    }
}

/// Parse and evaluate `src` against `context`.
pub fn evaluate(src: &str, context: &Map<String, Value>) -> Result<Num, ExprError> {
    let tokens = tokenize(src)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        len: src.len(),
    };
    let expr = parser.parse_pratt(0)?;
    if parser.peek().is_some() {
        return Err(parser.error("unexpected trailing input"));
    }
    eval(&expr, context)
}
