//! Filter expression splitting and literal parsing.
//!
//! A filter expression is a single line such as `'Flight Record' == 17000`,
//! `'15000' < 'Flight Record' < '17000'` or `'Takeoff Valid' is not null`.
//! Operands are literals: quoted strings, numbers, `True`/`False`, or
//! bracketed lists of those. Nothing is ever evaluated as code.

use crate::types::{EmsError, Result};
use regex::Regex;
use serde_json::Value;
use std::fmt;
use std::sync::OnceLock;

/// Operator patterns in the order they are tried. First match wins.
const OPERATOR_PATTERNS: &[&str] = &["[=!<>]=?", "not in", "in", "is null", "is not null"];

fn split_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        OPERATOR_PATTERNS
            .iter()
            .map(|op| {
                let source = if op.starts_with("is ") {
                    format!(r"^(.*)\s+({op})$")
                } else {
                    format!(r"^(.*)\s+({op})\s+(.*)\s+({op})\s+(.*)$|^(.*)\s+({op})\s+(.*)$")
                };
                Regex::new(&source).expect("operator pattern is a valid regex")
            })
            .collect()
    })
}

/// Split an expression into trimmed operand/operator tokens.
///
/// Returns 2 tokens for null checks (`operand, operator`), 3 for binary
/// expressions and 5 for range expressions.
pub fn split_expr(expr: &str) -> Result<Vec<String>> {
    let expr = expr.trim();
    for re in split_patterns() {
        if let Some(caps) = re.captures(expr) {
            let tokens: Vec<String> = caps
                .iter()
                .skip(1)
                .flatten()
                .map(|m| m.as_str().trim().to_string())
                .collect();
            if !tokens.is_empty() {
                return Ok(tokens);
            }
        }
    }
    Err(EmsError::MalformedExpression(format!(
        "cannot find any valid conditional operator in \"{}\"",
        expr
    )))
}

/// Basic comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Comparator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparator {
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "==" => Some(Comparator::Eq),
            "!=" => Some(Comparator::Ne),
            "<" => Some(Comparator::Lt),
            "<=" => Some(Comparator::Le),
            ">" => Some(Comparator::Gt),
            ">=" => Some(Comparator::Ge),
            _ => None,
        }
    }

    /// Mirror the comparison so that `a < b` reads as `b > a`.
    pub fn flip(self) -> Self {
        match self {
            Comparator::Lt => Comparator::Gt,
            Comparator::Le => Comparator::Ge,
            Comparator::Gt => Comparator::Lt,
            Comparator::Ge => Comparator::Le,
            other => other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Comparator::Eq => "==",
            Comparator::Ne => "!=",
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator of a binary expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Compare(Comparator),
    In,
    NotIn,
}

impl BinaryOp {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "in" => Some(BinaryOp::In),
            "not in" => Some(BinaryOp::NotIn),
            other => Comparator::parse(other).map(BinaryOp::Compare),
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BinaryOp::Compare(c) => fmt::Display::fmt(c, f),
            BinaryOp::In => f.write_str("in"),
            BinaryOp::NotIn => f.write_str("not in"),
        }
    }
}

/// Null check operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullCheck {
    IsNull,
    IsNotNull,
}

impl fmt::Display for NullCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NullCheck::IsNull => f.write_str("is null"),
            NullCheck::IsNotNull => f.write_str("is not null"),
        }
    }
}

/// A split expression with its operators recognised. Operands are still raw text.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Unary {
        operand: String,
        op: NullCheck,
    },
    Binary {
        left: String,
        op: BinaryOp,
        right: String,
    },
    /// `low outer field inner high`
    Range {
        low: String,
        outer: Comparator,
        field: String,
        inner: Comparator,
        high: String,
    },
}

impl Expression {
    pub fn parse(expr: &str) -> Result<Self> {
        let tokens = split_expr(expr)?;
        let malformed = |what: &str| {
            EmsError::MalformedExpression(format!("{} in \"{}\"", what, expr.trim()))
        };

        match tokens.as_slice() {
            [operand, op] => {
                let op = match op.as_str() {
                    "is null" => NullCheck::IsNull,
                    "is not null" => NullCheck::IsNotNull,
                    _ => return Err(malformed("unexpected unary operator")),
                };
                Ok(Expression::Unary {
                    operand: operand.clone(),
                    op,
                })
            }
            [left, op, right] => {
                let op = BinaryOp::parse(op)
                    .ok_or_else(|| malformed(&format!("unknown operator '{}'", op)))?;
                Ok(Expression::Binary {
                    left: left.clone(),
                    op,
                    right: right.clone(),
                })
            }
            [low, outer, field, inner, high] => {
                let outer = Comparator::parse(outer)
                    .ok_or_else(|| malformed(&format!("'{}' cannot bound a range", outer)))?;
                let inner = Comparator::parse(inner)
                    .ok_or_else(|| malformed(&format!("'{}' cannot bound a range", inner)))?;
                Ok(Expression::Range {
                    low: low.clone(),
                    outer,
                    field: field.clone(),
                    inner,
                    high: high.clone(),
                })
            }
            _ => Err(malformed("unexpected number of operands")),
        }
    }
}

/// A constant value written in a filter expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Literal>),
}

impl Literal {
    /// Parse a literal token. Only numbers, quoted strings, booleans and
    /// flat lists of those are accepted.
    pub fn parse(token: &str) -> Result<Self> {
        let mut parser = LiteralParser::new(token);
        parser.skip_whitespace();
        let lit = parser.parse_value(true)?;
        parser.skip_whitespace();
        if parser.current().is_some() {
            return Err(parser.error("unexpected trailing characters"));
        }
        Ok(lit)
    }

    /// Text used when matching against display values.
    pub fn display_value(&self) -> String {
        match self {
            Literal::Str(s) => s.clone(),
            other => other.to_string(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Int(i) => Value::from(*i),
            Literal::Float(f) => Value::from(*f),
            Literal::Str(s) => Value::String(s.clone()),
            Literal::List(items) => Value::Array(items.iter().map(Literal::to_json).collect()),
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Bool(true) => f.write_str("True"),
            Literal::Bool(false) => f.write_str("False"),
            Literal::Int(i) => write!(f, "{}", i),
            Literal::Float(x) => write!(f, "{}", x),
            Literal::Str(s) => write!(f, "'{}'", s),
            Literal::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    fmt::Display::fmt(item, f)?;
                }
                f.write_str("]")
            }
        }
    }
}

struct LiteralParser<'a> {
    input: &'a str,
    chars: Vec<char>,
    position: usize,
}

impl<'a> LiteralParser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            chars: input.chars().collect(),
            position: 0,
        }
    }

    fn current(&self) -> Option<char> {
        self.chars.get(self.position).copied()
    }

    fn advance(&mut self) {
        self.position += 1;
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.current(), Some(c) if c.is_whitespace()) {
            self.advance();
        }
    }

    fn error(&self, what: &str) -> EmsError {
        EmsError::MalformedExpression(format!(
            "{} at position {} of literal {}",
            what, self.position, self.input
        ))
    }

    fn parse_value(&mut self, allow_list: bool) -> Result<Literal> {
        match self.current() {
            Some('\'') | Some('"') => self.parse_string(),
            Some('[') if allow_list => self.parse_list(),
            Some('[') => Err(self.error("nested lists are not supported")),
            Some(c) if c.is_ascii_digit() || c == '-' || c == '+' || c == '.' => {
                self.parse_number()
            }
            Some(c) if c.is_alphabetic() => self.parse_keyword(),
            Some(_) => Err(self.error("unexpected character")),
            None => Err(self.error("missing value")),
        }
    }

    fn parse_string(&mut self) -> Result<Literal> {
        let quote = self.current();
        self.advance();
        let mut out = String::new();
        loop {
            match self.current() {
                None => return Err(self.error("unterminated string")),
                Some(c) if Some(c) == quote => {
                    self.advance();
                    return Ok(Literal::Str(out));
                }
                Some('\\') => {
                    self.advance();
                    let escaped = match self.current() {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('r') => '\r',
                        Some(c) => c,
                        None => return Err(self.error("unterminated escape")),
                    };
                    out.push(escaped);
                    self.advance();
                }
                Some(c) => {
                    out.push(c);
                    self.advance();
                }
            }
        }
    }

    fn parse_number(&mut self) -> Result<Literal> {
        let start = self.position;
        if matches!(self.current(), Some('-') | Some('+')) {
            self.advance();
        }
        let mut is_float = false;
        while let Some(c) = self.current() {
            match c {
                '0'..='9' | '_' => {}
                '.' | 'e' | 'E' => is_float = true,
                '-' | '+' if matches!(self.chars.get(self.position - 1), Some('e') | Some('E')) => {}
                _ => break,
            }
            self.advance();
        }
        let text: String = self.chars[start..self.position]
            .iter()
            .filter(|c| **c != '_')
            .collect();

        if !is_float {
            if let Ok(i) = text.parse::<i64>() {
                return Ok(Literal::Int(i));
            }
        }
        match text.parse::<f64>() {
            Ok(x) if x.is_finite() => Ok(Literal::Float(x)),
            Ok(_) => Err(self.error(&format!("number '{}' is out of range", text))),
            Err(_) => Err(self.error(&format!("invalid number '{}'", text))),
        }
    }

    fn parse_keyword(&mut self) -> Result<Literal> {
        let start = self.position;
        while matches!(self.current(), Some(c) if c.is_alphanumeric() || c == '_') {
            self.advance();
        }
        let word: String = self.chars[start..self.position].iter().collect();
        match word.as_str() {
            "True" | "true" => Ok(Literal::Bool(true)),
            "False" | "false" => Ok(Literal::Bool(false)),
            _ => Err(EmsError::MalformedExpression(format!(
                "'{}' is not a literal; quote names and text values",
                word
            ))),
        }
    }

    fn parse_list(&mut self) -> Result<Literal> {
        self.advance();
        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            if self.current() == Some(']') {
                self.advance();
                return Ok(Literal::List(items));
            }
            items.push(self.parse_value(false)?);
            self.skip_whitespace();
            match self.current() {
                Some(',') => self.advance(),
                Some(']') => {}
                Some(_) => return Err(self.error("expected ',' or ']'")),
                None => return Err(self.error("unterminated list")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_binary() {
        let tokens = split_expr("'Flight Record' == '17000'").unwrap();
        assert_eq!(tokens, vec!["'Flight Record'", "==", "'17000'"]);

        let tokens = split_expr("'Flight Record' >= 17000").unwrap();
        assert_eq!(tokens, vec!["'Flight Record'", ">=", "17000"]);
    }

    #[test]
    fn test_split_range() {
        let tokens = split_expr("'15000' <= 'Flight Record' <= '17000'").unwrap();
        assert_eq!(tokens, vec!["'15000'", "<=", "'Flight Record'", "<=", "'17000'"]);
    }

    #[test]
    fn test_split_special_operators() {
        let tokens = split_expr("'Flight Date Confidence' not in ['High', 'Low']").unwrap();
        assert_eq!(tokens, vec!["'Flight Date Confidence'", "not in", "['High', 'Low']"]);

        let tokens = split_expr("'Flight Date Confidence' in ['High', 'Low']").unwrap();
        assert_eq!(tokens[1], "in");

        let tokens = split_expr("'Takeoff Valid' is null").unwrap();
        assert_eq!(tokens, vec!["'Takeoff Valid'", "is null"]);

        let tokens = split_expr("'Takeoff Valid' is not null").unwrap();
        assert_eq!(tokens, vec!["'Takeoff Valid'", "is not null"]);
    }

    #[test]
    fn test_split_without_operator_fails() {
        let err = split_expr("'Flight Record' 17000").unwrap_err();
        assert!(matches!(err, EmsError::MalformedExpression(_)));

        // Null checks must terminate the expression.
        assert!(split_expr("'Takeoff Valid' is null please").is_err());
    }

    #[test]
    fn test_parse_expression_shapes() {
        let expr = Expression::parse("'15000' > 'Flight Record' > '17000'").unwrap();
        assert_eq!(
            expr,
            Expression::Range {
                low: "'15000'".into(),
                outer: Comparator::Gt,
                field: "'Flight Record'".into(),
                inner: Comparator::Gt,
                high: "'17000'".into(),
            }
        );

        let expr = Expression::parse("'Takeoff Valid' is not null").unwrap();
        assert!(matches!(expr, Expression::Unary { op: NullCheck::IsNotNull, .. }));
    }

    #[test]
    fn test_single_equals_is_malformed() {
        let err = Expression::parse("'Flight Record' = 1").unwrap_err();
        assert!(matches!(err, EmsError::MalformedExpression(_)));
    }

    #[test]
    fn test_comparator_flip() {
        assert_eq!(Comparator::Lt.flip(), Comparator::Gt);
        assert_eq!(Comparator::Ge.flip(), Comparator::Le);
        assert_eq!(Comparator::Eq.flip(), Comparator::Eq);
    }

    #[test]
    fn test_literal_scalars() {
        assert_eq!(Literal::parse("'17000'").unwrap(), Literal::Str("17000".into()));
        assert_eq!(Literal::parse("\"it's\"").unwrap(), Literal::Str("it's".into()));
        assert_eq!(Literal::parse("17000").unwrap(), Literal::Int(17000));
        assert_eq!(Literal::parse("-2.5").unwrap(), Literal::Float(-2.5));
        assert_eq!(Literal::parse("1e3").unwrap(), Literal::Float(1000.0));
        assert_eq!(Literal::parse("True").unwrap(), Literal::Bool(true));
        assert_eq!(Literal::parse("false").unwrap(), Literal::Bool(false));
    }

    #[test]
    fn test_literal_rejects_overflowing_float() {
        for token in ["1e999", "-1e999", "[1, 1e400]"] {
            let err = Literal::parse(token).unwrap_err();
            assert!(matches!(err, EmsError::MalformedExpression(_)), "literal {}", token);
        }
        assert_eq!(Literal::parse("1e300").unwrap(), Literal::Float(1e300));
    }

    #[test]
    fn test_literal_list() {
        let lit = Literal::parse("['High', 'Low', 3]").unwrap();
        assert_eq!(
            lit,
            Literal::List(vec![
                Literal::Str("High".into()),
                Literal::Str("Low".into()),
                Literal::Int(3),
            ])
        );
        assert_eq!(Literal::parse("[]").unwrap(), Literal::List(vec![]));
    }

    #[test]
    fn test_literal_rejects_code() {
        assert!(Literal::parse("__import__('os').system('ls')").is_err());
        assert!(Literal::parse("'a' + 'b'").is_err());
        assert!(Literal::parse("[[1]]").is_err());
        assert!(Literal::parse("'unterminated").is_err());
    }

    #[test]
    fn test_literal_json() {
        let lit = Literal::parse("['a', 1, True]").unwrap();
        assert_eq!(lit.to_json(), serde_json::json!(["a", 1, true]));
    }
}
