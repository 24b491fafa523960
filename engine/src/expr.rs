//! The expression language used by the filter and transform stages.
//!
//! Expressions are parsed once at pipeline construction and evaluated per
//! record against the JSON payload. The surface is deliberately small:
//! dotted field paths, literals, comparisons, boolean connectives, and a
//! handful of string helpers (`containsStr`, `startsWith`, `endsWith`,
//! `toLower`, `toUpper`). A reference to a missing field is an evaluation
//! error, which the processors classify as a per-record failure.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("unexpected character {0:?} at offset {1}")]
    UnexpectedChar(char, usize),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("unexpected token {0}")]
    UnexpectedToken(String),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unknown function {0}")]
    UnknownFunction(String),
    #[error("function {0} takes {1} argument(s)")]
    Arity(String, usize),
}

#[derive(Debug, Error, PartialEq)]
pub enum EvalError {
    #[error("field {0} not found in payload")]
    MissingField(String),
    #[error("cannot compare {0} and {1}")]
    Incomparable(&'static str, &'static str),
    #[error("expected {expected}, got {got}")]
    Type { expected: &'static str, got: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Func {
    ContainsStr,
    StartsWith,
    EndsWith,
    ToLower,
    ToUpper,
}

impl Func {
    fn resolve(name: &str) -> Option<(Func, usize)> {
        match name {
            "containsStr" => Some((Func::ContainsStr, 2)),
            "startsWith" => Some((Func::StartsWith, 2)),
            "endsWith" => Some((Func::EndsWith, 2)),
            "toLower" => Some((Func::ToLower, 1)),
            "toUpper" => Some((Func::ToUpper, 1)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Literal(Value),
    Path(Vec<String>),
    Compare(Box<Node>, CmpOp, Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Not(Box<Node>),
    Call(Func, Vec<Node>),
}

/// A parsed expression, evaluated against JSON payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Node,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, ParseError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(ParseError::UnexpectedToken(format!(
                "{:?}",
                parser.tokens[parser.pos]
            )));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate to an arbitrary JSON value (transform derivations).
    pub fn evaluate(&self, payload: &Value) -> Result<Value, EvalError> {
        eval(&self.root, payload)
    }

    /// Evaluate to a boolean (filter expressions).
    pub fn matches(&self, payload: &Value) -> Result<bool, EvalError> {
        match self.evaluate(payload)? {
            Value::Bool(b) => Ok(b),
            other => Err(EvalError::Type {
                expected: "boolean",
                got: type_name(&other),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Op(CmpOp),
    AndAnd,
    OrOr,
    Bang,
    LParen,
    RParen,
    Comma,
}

fn tokenize(source: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::AndAnd);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::OrOr);
                i += 2;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CmpOp::Eq));
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CmpOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Bang);
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CmpOp::Le));
                i += 2;
            }
            '<' => {
                tokens.push(Token::Op(CmpOp::Lt));
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CmpOp::Ge));
                i += 2;
            }
            '>' => {
                tokens.push(Token::Op(CmpOp::Gt));
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            value.push(ch);
                            i += 1;
                        }
                        None => return Err(ParseError::UnterminatedString),
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while chars
                    .get(i)
                    .is_some_and(|n| n.is_ascii_digit() || *n == '.')
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| ParseError::UnexpectedToken(text.clone()))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while chars
                    .get(i)
                    .is_some_and(|n| n.is_ascii_alphanumeric() || *n == '_' || *n == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(Token::Ident(word));
            }
            other => return Err(ParseError::UnexpectedChar(other, i)),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Token, ParseError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(ParseError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<Node, ParseError> {
        let mut left = self.parse_and()?;
        loop {
            let is_or = self.eat(&Token::OrOr)
                || matches!(self.peek(), Some(Token::Ident(w)) if w == "or") && {
                    self.pos += 1;
                    true
                };
            if !is_or {
                return Ok(left);
            }
            let right = self.parse_and()?;
            left = Node::Or(Box::new(left), Box::new(right));
        }
    }

    fn parse_and(&mut self) -> Result<Node, ParseError> {
        let mut left = self.parse_not()?;
        loop {
            let is_and = self.eat(&Token::AndAnd)
                || matches!(self.peek(), Some(Token::Ident(w)) if w == "and") && {
                    self.pos += 1;
                    true
                };
            if !is_and {
                return Ok(left);
            }
            let right = self.parse_not()?;
            left = Node::And(Box::new(left), Box::new(right));
        }
    }

    fn parse_not(&mut self) -> Result<Node, ParseError> {
        let is_not = self.eat(&Token::Bang)
            || matches!(self.peek(), Some(Token::Ident(w)) if w == "not") && {
                self.pos += 1;
                true
            };
        if is_not {
            let inner = self.parse_not()?;
            return Ok(Node::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Node, ParseError> {
        let left = self.parse_primary()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.pos += 1;
            let right = self.parse_primary()?;
            return Ok(Node::Compare(Box::new(left), op, Box::new(right)));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Node, ParseError> {
        match self.next()? {
            Token::Number(n) => Ok(Node::Literal(number_value(n))),
            Token::Str(s) => Ok(Node::Literal(Value::String(s))),
            Token::LParen => {
                let inner = self.parse_or()?;
                if !self.eat(&Token::RParen) {
                    return Err(ParseError::UnexpectedEnd);
                }
                Ok(inner)
            }
            Token::Ident(word) => match word.as_str() {
                "true" => Ok(Node::Literal(Value::Bool(true))),
                "false" => Ok(Node::Literal(Value::Bool(false))),
                "null" => Ok(Node::Literal(Value::Null)),
                _ => {
                    if self.eat(&Token::LParen) {
                        let (func, arity) = Func::resolve(&word)
                            .ok_or_else(|| ParseError::UnknownFunction(word.clone()))?;
                        let mut args = Vec::new();
                        if !self.eat(&Token::RParen) {
                            loop {
                                args.push(self.parse_or()?);
                                if self.eat(&Token::RParen) {
                                    break;
                                }
                                if !self.eat(&Token::Comma) {
                                    return Err(ParseError::UnexpectedEnd);
                                }
                            }
                        }
                        if args.len() != arity {
                            return Err(ParseError::Arity(word, arity));
                        }
                        Ok(Node::Call(func, args))
                    } else {
                        Ok(Node::Path(word.split('.').map(str::to_string).collect()))
                    }
                }
            },
            other => Err(ParseError::UnexpectedToken(format!("{other:?}"))),
        }
    }
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        Value::from(n)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn lookup<'a>(payload: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut current = payload;
    for segment in path {
        current = current.get(segment)?;
    }
    Some(current)
}

fn eval(node: &Node, payload: &Value) -> Result<Value, EvalError> {
    match node {
        Node::Literal(value) => Ok(value.clone()),
        Node::Path(path) => lookup(payload, path)
            .cloned()
            .ok_or_else(|| EvalError::MissingField(path.join("."))),
        Node::Compare(left, op, right) => {
            let left = eval(left, payload)?;
            let right = eval(right, payload)?;
            compare(&left, *op, &right).map(Value::Bool)
        }
        Node::And(left, right) => {
            if !as_bool(&eval(left, payload)?)? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(as_bool(&eval(right, payload)?)?))
        }
        Node::Or(left, right) => {
            if as_bool(&eval(left, payload)?)? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(as_bool(&eval(right, payload)?)?))
        }
        Node::Not(inner) => Ok(Value::Bool(!as_bool(&eval(inner, payload)?)?)),
        Node::Call(func, args) => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval(arg, payload)?);
            }
            apply(*func, &values)
        }
    }
}

fn as_bool(value: &Value) -> Result<bool, EvalError> {
    match value {
        Value::Bool(b) => Ok(*b),
        other => Err(EvalError::Type {
            expected: "boolean",
            got: type_name(other),
        }),
    }
}

fn as_str(value: &Value) -> Result<&str, EvalError> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(EvalError::Type {
            expected: "string",
            got: type_name(other),
        }),
    }
}

fn apply(func: Func, args: &[Value]) -> Result<Value, EvalError> {
    match func {
        Func::ContainsStr => Ok(Value::Bool(as_str(&args[0])?.contains(as_str(&args[1])?))),
        Func::StartsWith => Ok(Value::Bool(
            as_str(&args[0])?.starts_with(as_str(&args[1])?),
        )),
        Func::EndsWith => Ok(Value::Bool(as_str(&args[0])?.ends_with(as_str(&args[1])?))),
        Func::ToLower => Ok(Value::String(as_str(&args[0])?.to_lowercase())),
        Func::ToUpper => Ok(Value::String(as_str(&args[0])?.to_uppercase())),
    }
}

fn compare(left: &Value, op: CmpOp, right: &Value) -> Result<bool, EvalError> {
    use std::cmp::Ordering;

    let ordering = match (left, right) {
        (Value::Number(l), Value::Number(r)) => {
            let (l, r) = (l.as_f64().unwrap_or(f64::NAN), r.as_f64().unwrap_or(f64::NAN));
            l.partial_cmp(&r)
        }
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        (Value::Bool(l), Value::Bool(r)) => Some(l.cmp(r)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (l, r) => {
            // equality across types is well-defined (false); ordering is not
            if matches!(op, CmpOp::Eq) {
                return Ok(false);
            }
            if matches!(op, CmpOp::Ne) {
                return Ok(true);
            }
            return Err(EvalError::Incomparable(type_name(l), type_name(r)));
        }
    };

    let Some(ordering) = ordering else {
        return Err(EvalError::Incomparable(type_name(left), type_name(right)));
    };

    Ok(match op {
        CmpOp::Eq => ordering == Ordering::Equal,
        CmpOp::Ne => ordering != Ordering::Equal,
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::Le => ordering != Ordering::Greater,
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::Ge => ordering != Ordering::Less,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_comparisons() {
        let expr = Expression::parse("age < 18").unwrap();
        assert!(expr.matches(&json!({"age": 15})).unwrap());
        assert!(!expr.matches(&json!({"age": 25})).unwrap());
        assert!(!expr.matches(&json!({"age": 18})).unwrap());

        let expr = Expression::parse("age >= 18").unwrap();
        assert!(expr.matches(&json!({"age": 18})).unwrap());
    }

    #[test]
    fn missing_field_is_an_error() {
        let expr = Expression::parse("age < 18").unwrap();
        assert_eq!(
            expr.matches(&json!({"name": "x"})),
            Err(EvalError::MissingField("age".to_string()))
        );

        let expr = Expression::parse("containsStr(tet, \"x\")").unwrap();
        assert_eq!(
            expr.matches(&json!({"text": "xyz"})),
            Err(EvalError::MissingField("tet".to_string()))
        );
    }

    #[test]
    fn string_functions() {
        let expr = Expression::parse("containsStr(name, 'ann')").unwrap();
        assert!(expr.matches(&json!({"name": "joanna"})).unwrap());
        assert!(!expr.matches(&json!({"name": "bob"})).unwrap());

        let expr = Expression::parse("startsWith(name, 'jo') && endsWith(name, 'na')").unwrap();
        assert!(expr.matches(&json!({"name": "joanna"})).unwrap());

        let expr = Expression::parse("toUpper(code)").unwrap();
        assert_eq!(
            expr.evaluate(&json!({"code": "abc"})).unwrap(),
            json!("ABC")
        );
    }

    #[test]
    fn boolean_connectives() {
        let expr = Expression::parse("age >= 18 && country == 'NL'").unwrap();
        assert!(expr
            .matches(&json!({"age": 30, "country": "NL"}))
            .unwrap());
        assert!(!expr
            .matches(&json!({"age": 30, "country": "DE"}))
            .unwrap());

        let expr = Expression::parse("vip or age >= 65").unwrap();
        assert!(expr.matches(&json!({"vip": true, "age": 20})).unwrap());
        assert!(expr.matches(&json!({"vip": false, "age": 70})).unwrap());

        let expr = Expression::parse("!(a == 1)").unwrap();
        assert!(expr.matches(&json!({"a": 2})).unwrap());
    }

    #[test]
    fn dotted_paths() {
        let expr = Expression::parse("user.address.city == 'haarlem'").unwrap();
        assert!(expr
            .matches(&json!({"user": {"address": {"city": "haarlem"}}}))
            .unwrap());
    }

    #[test]
    fn equality_across_types() {
        let expr = Expression::parse("a == 'x'").unwrap();
        assert!(!expr.matches(&json!({"a": 5})).unwrap());
        let expr = Expression::parse("a != 'x'").unwrap();
        assert!(expr.matches(&json!({"a": 5})).unwrap());
        // ordering across types has no meaning
        let expr = Expression::parse("a < 'x'").unwrap();
        assert!(expr.matches(&json!({"a": 5})).is_err());
    }

    #[test]
    fn non_boolean_filter_result_is_an_error() {
        let expr = Expression::parse("name").unwrap();
        assert_eq!(
            expr.matches(&json!({"name": "x"})),
            Err(EvalError::Type {
                expected: "boolean",
                got: "string"
            })
        );
    }

    #[test]
    fn parse_errors() {
        assert!(Expression::parse("age <").is_err());
        assert!(Expression::parse("unknownFn(a)").is_err());
        assert!(Expression::parse("containsStr(a)").is_err());
        assert!(Expression::parse("'unterminated").is_err());
        assert!(Expression::parse("a ==").is_err());
        assert!(Expression::parse("a @ b").is_err());
    }

    #[test]
    fn evaluates_plain_derivations() {
        let expr = Expression::parse("user.id").unwrap();
        assert_eq!(
            expr.evaluate(&json!({"user": {"id": 42}})).unwrap(),
            json!(42)
        );
    }
}
