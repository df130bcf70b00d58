//! The expression evaluator seam.
//!
//! Constraints, relation `expressionGet`/`expressionSet` and `literal` values
//! are evaluated through [`Evaluator`]. [`ExprEvaluator`] is a small
//! Python-flavoured expression language that covers what data models need;
//! any other engine can be plugged in behind the trait.

use crate::error::ScriptError;
use crate::value::Value;
use std::collections::HashMap;

/// Variables visible to an expression.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    vars: HashMap<String, Value>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }
}

pub trait Evaluator {
    fn name(&self) -> &'static str;
    fn evaluate(&self, expression: &str, scope: &Scope) -> Result<Value, ScriptError>;
}

/// Pratt-parsed integer/float/bool/string expressions.
///
/// Supports `and`/`or`/`not`, comparisons, `+ - * / // % **`, bitwise
/// `& | ^ ~ << >>`, parentheses, variables and the functions `len`, `int`,
/// `str`, `abs`, `min` and `max`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExprEvaluator;

impl Evaluator for ExprEvaluator {
    fn name(&self) -> &'static str {
        "ExprEvaluator"
    }

    fn evaluate(&self, expression: &str, scope: &Scope) -> Result<Value, ScriptError> {
        let mut parser = Parser {
            expression,
            tokens: tokenize(expression)?,
            pos: 0,
        };
        let ast = parser.expr(0)?;
        if let Some((at, token)) = parser.tokens.get(parser.pos) {
            return Err(parser.syntax(*at, format!("unexpected {token:?}")));
        }
        eval_expr(&ast, scope)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i128),
    Float(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
}

const OPERATORS: [&str; 22] = [
    "**", "//", "<<", ">>", "==", "!=", "<=", ">=", "+", "-", "*", "/", "%", "&", "|", "^", "~",
    "<", ">", "!", "(", ")",
];

fn tokenize(expression: &str) -> Result<Vec<(usize, Token)>, ScriptError> {
    let syntax = |position: usize, reason: &str| ScriptError::Syntax {
        expression: expression.to_string(),
        position,
        reason: reason.to_string(),
    };
    let chars: Vec<char> = expression.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let start = i;
        if c.is_ascii_digit() {
            if c == '0' && matches!(chars.get(i + 1), Some('x') | Some('X')) {
                i += 2;
                while i < chars.len() && chars[i].is_ascii_hexdigit() {
                    i += 1;
                }
                let digits: String = chars[start + 2..i].iter().collect();
                let value = i128::from_str_radix(&digits, 16)
                    .map_err(|_| syntax(start, "bad hex literal"))?;
                tokens.push((start, Token::Int(value)));
                continue;
            }
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let token = if text.contains('.') {
                Token::Float(text.parse().map_err(|_| syntax(start, "bad float literal"))?)
            } else {
                Token::Int(text.parse().map_err(|_| syntax(start, "bad integer literal"))?)
            };
            tokens.push((start, token));
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push((start, Token::Ident(chars[start..i].iter().collect())));
            continue;
        }
        if c == '\'' || c == '"' {
            i += 1;
            let mut text = String::new();
            loop {
                match chars.get(i) {
                    None => return Err(syntax(start, "unterminated string")),
                    Some(q) if *q == c => break,
                    Some('\\') => {
                        let escaped = chars
                            .get(i + 1)
                            .ok_or_else(|| syntax(i, "dangling escape"))?;
                        text.push(match escaped {
                            'n' => '\n',
                            'r' => '\r',
                            't' => '\t',
                            '0' => '\0',
                            other => *other,
                        });
                        i += 2;
                    }
                    Some(ch) => {
                        text.push(*ch);
                        i += 1;
                    }
                }
            }
            i += 1;
            tokens.push((start, Token::Str(text)));
            continue;
        }
        if c == ',' {
            tokens.push((start, Token::Comma));
            i += 1;
            continue;
        }
        let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
        let op = OPERATORS
            .iter()
            .find(|op| rest.starts_with(**op))
            .ok_or_else(|| syntax(start, "unexpected character"))?;
        i += op.len();
        tokens.push((
            start,
            match *op {
                "(" => Token::LParen,
                ")" => Token::RParen,
                other => Token::Op(other),
            },
        ));
    }
    Ok(tokens)
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Var(String),
    Unary(&'static str, Box<Expr>),
    Binary(String, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

struct Parser<'a> {
    expression: &'a str,
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

fn binding_power(op: &str) -> Option<(u8, u8)> {
    Some(match op {
        "or" => (1, 2),
        "and" => (3, 4),
        "==" | "!=" | "<" | "<=" | ">" | ">=" => (7, 8),
        "|" => (9, 10),
        "^" => (11, 12),
        "&" => (13, 14),
        "<<" | ">>" => (15, 16),
        "+" | "-" => (17, 18),
        "*" | "/" | "//" | "%" => (19, 20),
        "**" => (24, 23),
        _ => return None,
    })
}

const UNARY_BP: u8 = 21;
const NOT_BP: u8 = 5;

impl Parser<'_> {
    fn syntax(&self, position: usize, reason: impl Into<String>) -> ScriptError {
        ScriptError::Syntax {
            expression: self.expression.to_string(),
            position,
            reason: reason.into(),
        }
    }

    fn next(&mut self) -> Result<(usize, Token), ScriptError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| self.syntax(self.expression.len(), "unexpected end of expression"))?;
        self.pos += 1;
        Ok(token)
    }

    fn peek_operator(&self) -> Option<String> {
        match self.tokens.get(self.pos) {
            Some((_, Token::Op(op))) => Some((*op).to_string()),
            Some((_, Token::Ident(word))) if word == "and" || word == "or" => Some(word.clone()),
            _ => None,
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), ScriptError> {
        let (at, token) = self.next()?;
        if token != expected {
            return Err(self.syntax(at, format!("expected {expected:?}, found {token:?}")));
        }
        Ok(())
    }

    fn expr(&mut self, min_bp: u8) -> Result<Expr, ScriptError> {
        let mut lhs = self.prefix()?;
        while let Some(op) = self.peek_operator() {
            let Some((left_bp, right_bp)) = binding_power(&op) else {
                break;
            };
            if left_bp < min_bp {
                break;
            }
            self.pos += 1;
            let rhs = self.expr(right_bp)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn prefix(&mut self) -> Result<Expr, ScriptError> {
        let (at, token) = self.next()?;
        match token {
            Token::Int(v) => Ok(Expr::Literal(Value::Integer(v))),
            Token::Float(v) => Ok(Expr::Literal(Value::Float(v))),
            Token::Str(s) => Ok(Expr::Literal(Value::Text(s))),
            Token::LParen => {
                let inner = self.expr(0)?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::Op(op @ ("-" | "+" | "~")) => {
                Ok(Expr::Unary(op, Box::new(self.expr(UNARY_BP)?)))
            }
            Token::Op("!") => Ok(Expr::Unary("not", Box::new(self.expr(UNARY_BP)?))),
            Token::Ident(word) => match word.as_str() {
                "True" | "true" => Ok(Expr::Literal(Value::Bool(true))),
                "False" | "false" => Ok(Expr::Literal(Value::Bool(false))),
                "not" => Ok(Expr::Unary("not", Box::new(self.expr(NOT_BP)?))),
                _ if matches!(self.tokens.get(self.pos), Some((_, Token::LParen))) => {
                    self.pos += 1;
                    Ok(Expr::Call(word, self.arguments()?))
                }
                _ => Ok(Expr::Var(word)),
            },
            other => Err(self.syntax(at, format!("unexpected {other:?}"))),
        }
    }

    fn arguments(&mut self) -> Result<Vec<Expr>, ScriptError> {
        let mut args = Vec::new();
        if matches!(self.tokens.get(self.pos), Some((_, Token::RParen))) {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.expr(0)?);
            let (at, token) = self.next()?;
            match token {
                Token::Comma => continue,
                Token::RParen => return Ok(args),
                other => {
                    return Err(self.syntax(at, format!("expected ',' or ')', found {other:?}")));
                }
            }
        }
    }
}

fn eval_expr(expr: &Expr, scope: &Scope) -> Result<Value, ScriptError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Var(name) => scope
            .get(name)
            .cloned()
            .ok_or_else(|| ScriptError::UnknownVariable(name.clone())),
        Expr::Unary(op, operand) => {
            let value = eval_expr(operand, scope)?;
            match (*op, value) {
                ("not", v) => Ok(Value::Bool(!v.truthy())),
                ("+", v @ (Value::Integer(_) | Value::Float(_))) => Ok(v),
                ("-", v) => negate(v),
                ("~", Value::Integer(v)) => Ok(Value::Integer(!v)),
                (op, v) => Err(mismatch(op, &v, &v)),
            }
        }
        // Short-circuit so the unused side may reference unbound names.
        Expr::Binary(op, lhs, rhs) if op == "and" || op == "or" => {
            let left = eval_expr(lhs, scope)?;
            if left.truthy() == (op == "or") {
                Ok(left)
            } else {
                eval_expr(rhs, scope)
            }
        }
        Expr::Binary(op, lhs, rhs) => binary(op, eval_expr(lhs, scope)?, eval_expr(rhs, scope)?),
        Expr::Call(name, args) => {
            let values = args
                .iter()
                .map(|arg| eval_expr(arg, scope))
                .collect::<Result<Vec<_>, _>>()?;
            call(name, values)
        }
    }
}

fn mismatch(op: &str, left: &Value, right: &Value) -> ScriptError {
    ScriptError::TypeMismatch {
        op: op.to_string(),
        left: left.type_name(),
        right: right.type_name(),
    }
}

fn negate(value: Value) -> Result<Value, ScriptError> {
    match value {
        Value::Integer(v) => v.checked_neg().map(Value::Integer).ok_or(ScriptError::Overflow),
        Value::Float(v) => Ok(Value::Float(-v)),
        other => Err(mismatch("-", &other, &other)),
    }
}

fn numeric(value: &Value) -> Option<Value> {
    match value {
        Value::Bool(b) => Some(Value::Integer(*b as i128)),
        Value::Integer(_) | Value::Float(_) => Some(value.clone()),
        _ => None,
    }
}

fn binary(op: &str, lhs: Value, rhs: Value) -> Result<Value, ScriptError> {
    if let ("==" | "!=", Some(ordering)) = (op, compare(&lhs, &rhs)) {
        let equal = ordering == std::cmp::Ordering::Equal;
        return Ok(Value::Bool(if op == "==" { equal } else { !equal }));
    }
    if matches!(op, "==" | "!=") {
        let equal = lhs == rhs;
        return Ok(Value::Bool(if op == "==" { equal } else { !equal }));
    }
    if matches!(op, "<" | "<=" | ">" | ">=") {
        let ordering = compare(&lhs, &rhs).ok_or_else(|| mismatch(op, &lhs, &rhs))?;
        return Ok(Value::Bool(match op {
            "<" => ordering.is_lt(),
            "<=" => ordering.is_le(),
            ">" => ordering.is_gt(),
            _ => ordering.is_ge(),
        }));
    }
    if op == "+" {
        match (&lhs, &rhs) {
            (Value::Text(a), Value::Text(b)) => return Ok(Value::Text(format!("{a}{b}"))),
            (Value::Bits(a), Value::Bits(b)) => {
                let mut joined = a.clone();
                joined.append(b);
                return Ok(Value::Bits(joined));
            }
            _ => {}
        }
    }
    let (Some(a), Some(b)) = (numeric(&lhs), numeric(&rhs)) else {
        return Err(mismatch(op, &lhs, &rhs));
    };
    match (a, b) {
        (Value::Integer(a), Value::Integer(b)) => integer_op(op, a, b),
        (a, b) => {
            let (Ok(x), Ok(y)) = (a.as_float(), b.as_float()) else {
                return Err(mismatch(op, &lhs, &rhs));
            };
            float_op(op, x, y).ok_or_else(|| mismatch(op, &lhs, &rhs))
        }
    }
}

fn integer_op(op: &str, a: i128, b: i128) -> Result<Value, ScriptError> {
    let result = match op {
        "+" => a.checked_add(b),
        "-" => a.checked_sub(b),
        "*" => a.checked_mul(b),
        "/" if b != 0 && a % b != 0 => return Ok(Value::Float(a as f64 / b as f64)),
        "/" | "//" => {
            if b == 0 {
                return Err(ScriptError::DivisionByZero);
            }
            let q = a / b;
            Some(if a % b != 0 && (a < 0) != (b < 0) { q - 1 } else { q })
        }
        "%" => {
            if b == 0 {
                return Err(ScriptError::DivisionByZero);
            }
            let r = a % b;
            Some(if r != 0 && (r < 0) != (b < 0) { r + b } else { r })
        }
        "**" => u32::try_from(b).ok().and_then(|exp| a.checked_pow(exp)),
        "&" => Some(a & b),
        "|" => Some(a | b),
        "^" => Some(a ^ b),
        "<<" => u32::try_from(b).ok().and_then(|s| a.checked_shl(s)),
        ">>" => u32::try_from(b).ok().and_then(|s| a.checked_shr(s)),
        _ => {
            return Err(ScriptError::TypeMismatch {
                op: op.to_string(),
                left: "integer",
                right: "integer",
            });
        }
    };
    result.map(Value::Integer).ok_or(ScriptError::Overflow)
}

fn float_op(op: &str, a: f64, b: f64) -> Option<Value> {
    Some(Value::Float(match op {
        "+" => a + b,
        "-" => a - b,
        "*" => a * b,
        "/" => a / b,
        "//" => (a / b).floor(),
        "%" => a - b * (a / b).floor(),
        "**" => a.powf(b),
        _ => return None,
    }))
}

fn compare(lhs: &Value, rhs: &Value) -> Option<std::cmp::Ordering> {
    match (lhs, rhs) {
        (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
        (Value::Bits(a), Value::Bits(b)) => Some(a.as_bytes().cmp(b.as_bytes())),
        _ => match (numeric(lhs)?, numeric(rhs)?) {
            (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(&b)),
            (a, b) => a.as_float().ok()?.partial_cmp(&b.as_float().ok()?),
        },
    }
}

fn call(name: &str, args: Vec<Value>) -> Result<Value, ScriptError> {
    let arity = |n: usize| -> Result<(), ScriptError> {
        if args.len() != n {
            return Err(ScriptError::TypeMismatch {
                op: format!("{name}() with {} arguments", args.len()),
                left: "arguments",
                right: "arguments",
            });
        }
        Ok(())
    };
    match name {
        "len" => {
            arity(1)?;
            match &args[0] {
                Value::Text(s) => Ok(Value::Integer(s.chars().count() as i128)),
                Value::Bits(b) => Ok(Value::Integer(b.len_bytes() as i128)),
                other => Err(mismatch("len", other, other)),
            }
        }
        "int" => {
            arity(1)?;
            match &args[0] {
                Value::Float(f) => Ok(Value::Integer(f.trunc() as i128)),
                other => other
                    .as_integer()
                    .map(Value::Integer)
                    .map_err(|_| mismatch("int", other, other)),
            }
        }
        "str" => {
            arity(1)?;
            Ok(Value::Text(args[0].to_string()))
        }
        "abs" => {
            arity(1)?;
            match &args[0] {
                Value::Integer(v) => Ok(Value::Integer(v.abs())),
                Value::Float(v) => Ok(Value::Float(v.abs())),
                other => Err(mismatch("abs", other, other)),
            }
        }
        "min" | "max" => {
            let mut iter = args.into_iter();
            let first = iter.next().ok_or_else(|| ScriptError::TypeMismatch {
                op: format!("{name}() with no arguments"),
                left: "arguments",
                right: "arguments",
            })?;
            iter.try_fold(first, |best, candidate| {
                let ordering =
                    compare(&candidate, &best).ok_or_else(|| mismatch(name, &best, &candidate))?;
                let better = if name == "min" {
                    ordering.is_lt()
                } else {
                    ordering.is_gt()
                };
                Ok(if better { candidate } else { best })
            })
        }
        _ => Err(ScriptError::UnknownFunction(name.to_string())),
    }
}
