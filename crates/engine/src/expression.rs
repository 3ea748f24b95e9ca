//! Expression evaluation for guards and dynamic event names
//!
//! The runtime talks to an [`ExpressionEvaluator`]. The default
//! [`SimpleExpressionEvaluator`] understands a small boolean language:
//!
//! ```text
//! expr    := or
//! or      := and ("||" and)*
//! and     := equal ("&&" equal)*
//! equal   := compare (("==" | "!=") compare)*
//! compare := unary (("<" | "<=" | ">" | ">=") unary)?
//! unary   := ("!" | "-") unary | primary
//! primary := number | string | true | false | null | path | "(" expr ")"
//! path    := ident ("." ident)*
//! ```
//!
//! Input may be wrapped in `${...}`.

use serde_json::Value;

use crate::persistence::Variables;

/// Expression errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("syntax error at {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("condition '{expression}' evaluated to non-boolean {value}")]
    NotBoolean { expression: String, value: Value },
}

/// Variables visible to an expression
pub trait VariableScope {
    fn resolve(&self, name: &str) -> Option<Value>;
}

impl VariableScope for Variables {
    fn resolve(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

/// Evaluates guard conditions and name expressions against a variable scope
///
/// Called synchronously from inside a unit of work.
pub trait ExpressionEvaluator: Send + Sync + 'static {
    fn evaluate(&self, expression: &str, scope: &dyn VariableScope)
        -> Result<Value, ExpressionError>;

    /// Evaluate a guard; only boolean results are accepted
    fn evaluate_condition(
        &self,
        expression: &str,
        scope: &dyn VariableScope,
    ) -> Result<bool, ExpressionError> {
        match self.evaluate(expression, scope)? {
            Value::Bool(b) => Ok(b),
            value => Err(ExpressionError::NotBoolean {
                expression: expression.to_string(),
                value,
            }),
        }
    }

    /// Resolve a message, signal or error name that may be an expression
    fn resolve_name(
        &self,
        name: &str,
        scope: &dyn VariableScope,
    ) -> Result<String, ExpressionError> {
        if !name.contains("${") {
            return Ok(name.to_string());
        }
        match self.evaluate(name, scope)? {
            Value::String(s) => Ok(s),
            Value::Null => Err(ExpressionError::TypeMismatch(format!(
                "name expression '{name}' evaluated to null"
            ))),
            other => Ok(other.to_string()),
        }
    }
}

/// Default evaluator for the grammar in the module docs
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleExpressionEvaluator;

impl ExpressionEvaluator for SimpleExpressionEvaluator {
    fn evaluate(
        &self,
        expression: &str,
        scope: &dyn VariableScope,
    ) -> Result<Value, ExpressionError> {
        let source = unwrap_delimiters(expression);
        let tokens = Lexer::new(source).tokenize()?;
        let expr = Parser::new(tokens).parse()?;
        eval(&expr, scope)
    }
}

fn unwrap_delimiters(expression: &str) -> &str {
    let trimmed = expression.trim();
    trimmed
        .strip_prefix("${")
        .and_then(|s| s.strip_suffix('}'))
        .unwrap_or(trimmed)
}

// =============================================================================
// Lexer
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    Dot,
    LeftParen,
    RightParen,
    Not,
    Minus,
    And,
    Or,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Eof,
}

struct Lexer<'a> {
    input: &'a str,
    position: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, position: 0 }
    }

    fn tokenize(&mut self) -> Result<Vec<(usize, Token)>, ExpressionError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_whitespace();
            let start = self.position;
            let token = self.next_token()?;
            let done = token == Token::Eof;
            tokens.push((start, token));
            if done {
                return Ok(tokens);
            }
        }
    }

    fn current_char(&self) -> Option<char> {
        self.input[self.position..].chars().next()
    }

    fn peek(&self) -> Option<char> {
        let mut chars = self.input[self.position..].chars();
        chars.next();
        chars.next()
    }

    fn advance(&mut self) {
        if let Some(ch) = self.current_char() {
            self.position += ch.len_utf8();
        }
    }

    fn skip_whitespace(&mut self) {
        while self.current_char().is_some_and(char::is_whitespace) {
            self.advance();
        }
    }

    fn error(&self, message: impl Into<String>) -> ExpressionError {
        ExpressionError::Syntax {
            position: self.position,
            message: message.into(),
        }
    }

    fn two_char(&mut self, second: char, double: Token, single: Option<Token>) -> Result<Token, ExpressionError> {
        let first = self.current_char();
        self.advance();
        if self.current_char() == Some(second) {
            self.advance();
            return Ok(double);
        }
        single.ok_or_else(|| self.error(format!("unexpected character {:?}", first)))
    }

    fn next_token(&mut self) -> Result<Token, ExpressionError> {
        let Some(ch) = self.current_char() else {
            return Ok(Token::Eof);
        };

        match ch {
            '(' => {
                self.advance();
                Ok(Token::LeftParen)
            }
            ')' => {
                self.advance();
                Ok(Token::RightParen)
            }
            '.' if !self.peek().is_some_and(|c| c.is_ascii_digit()) => {
                self.advance();
                Ok(Token::Dot)
            }
            '-' => {
                self.advance();
                Ok(Token::Minus)
            }
            '!' => self.two_char('=', Token::NotEq, Some(Token::Not)),
            '=' => self.two_char('=', Token::Eq, None),
            '&' => self.two_char('&', Token::And, None),
            '|' => self.two_char('|', Token::Or, None),
            '<' => self.two_char('=', Token::LtEq, Some(Token::Lt)),
            '>' => self.two_char('=', Token::GtEq, Some(Token::Gt)),
            '\'' | '"' => self.string(ch),
            c if c.is_ascii_digit() || c == '.' => self.number(),
            c if c.is_alphabetic() || c == '_' => Ok(self.identifier()),
            other => Err(self.error(format!("unexpected character {other:?}"))),
        }
    }

    fn string(&mut self, quote: char) -> Result<Token, ExpressionError> {
        self.advance();
        let mut value = String::new();
        loop {
            match self.current_char() {
                None => return Err(self.error("unterminated string")),
                Some(c) if c == quote => {
                    self.advance();
                    return Ok(Token::Str(value));
                }
                Some('\\') => {
                    self.advance();
                    match self.current_char() {
                        Some(escaped) => {
                            value.push(escaped);
                            self.advance();
                        }
                        None => return Err(self.error("unterminated string")),
                    }
                }
                Some(c) => {
                    value.push(c);
                    self.advance();
                }
            }
        }
    }

    fn number(&mut self) -> Result<Token, ExpressionError> {
        let start = self.position;
        while self
            .current_char()
            .is_some_and(|c| c.is_ascii_digit() || c == '.')
        {
            self.advance();
        }
        let text = &self.input[start..self.position];
        text.parse::<f64>()
            .map(Token::Number)
            .map_err(|_| self.error(format!("invalid number {text:?}")))
    }

    fn identifier(&mut self) -> Token {
        let start = self.position;
        while self
            .current_char()
            .is_some_and(|c| c.is_alphanumeric() || c == '_')
        {
            self.advance();
        }
        match &self.input[start..self.position] {
            "true" => Token::True,
            "false" => Token::False,
            "null" => Token::Null,
            ident => Token::Ident(ident.to_string()),
        }
    }
}

// =============================================================================
// Parser
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(Vec<String>),
    Not(Box<Expr>),
    Negate(Box<Expr>),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinaryOp {
    And,
    Or,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    position: usize,
}

impl Parser {
    fn new(tokens: Vec<(usize, Token)>) -> Self {
        Self {
            tokens,
            position: 0,
        }
    }

    fn parse(&mut self) -> Result<Expr, ExpressionError> {
        let expr = self.parse_or()?;
        match self.current() {
            Token::Eof => Ok(expr),
            other => Err(self.error(format!("unexpected token {other:?}"))),
        }
    }

    fn current(&self) -> &Token {
        self.tokens
            .get(self.position)
            .map(|(_, t)| t)
            .unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) {
        if self.position < self.tokens.len() {
            self.position += 1;
        }
    }

    fn error(&self, message: impl Into<String>) -> ExpressionError {
        ExpressionError::Syntax {
            position: self
                .tokens
                .get(self.position)
                .map(|(p, _)| *p)
                .unwrap_or_default(),
            message: message.into(),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_and()?;
        while self.current() == &Token::Or {
            self.advance();
            let right = self.parse_and()?;
            left = binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_equality()?;
        while self.current() == &Token::And {
            self.advance();
            let right = self.parse_equality()?;
            left = binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = match self.current() {
                Token::Eq => BinaryOp::Eq,
                Token::NotEq => BinaryOp::NotEq,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_comparison()?;
            left = binary(op, left, right);
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.parse_unary()?;
        let op = match self.current() {
            Token::Lt => BinaryOp::Lt,
            Token::LtEq => BinaryOp::LtEq,
            Token::Gt => BinaryOp::Gt,
            Token::GtEq => BinaryOp::GtEq,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_unary()?;
        Ok(binary(op, left, right))
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        match self.current() {
            Token::Not => {
                self.advance();
                Ok(Expr::Not(Box::new(self.parse_unary()?)))
            }
            Token::Minus => {
                self.advance();
                Ok(Expr::Negate(Box::new(self.parse_unary()?)))
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        let token = self.current().clone();
        match token {
            Token::Number(n) => {
                self.advance();
                Ok(Expr::Literal(number(n)))
            }
            Token::Str(s) => {
                self.advance();
                Ok(Expr::Literal(Value::String(s)))
            }
            Token::True => {
                self.advance();
                Ok(Expr::Literal(Value::Bool(true)))
            }
            Token::False => {
                self.advance();
                Ok(Expr::Literal(Value::Bool(false)))
            }
            Token::Null => {
                self.advance();
                Ok(Expr::Literal(Value::Null))
            }
            Token::Ident(name) => {
                self.advance();
                let mut path = vec![name];
                while self.current() == &Token::Dot {
                    self.advance();
                    match self.current().clone() {
                        Token::Ident(segment) => {
                            self.advance();
                            path.push(segment);
                        }
                        other => {
                            return Err(self.error(format!("expected field name, got {other:?}")))
                        }
                    }
                }
                Ok(Expr::Path(path))
            }
            Token::LeftParen => {
                self.advance();
                let inner = self.parse_or()?;
                if self.current() != &Token::RightParen {
                    return Err(self.error("expected ')'"));
                }
                self.advance();
                Ok(inner)
            }
            other => Err(self.error(format!("unexpected token {other:?}"))),
        }
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

// =============================================================================
// Evaluation
// =============================================================================

fn eval(expr: &Expr, scope: &dyn VariableScope) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Path(path) => {
            let (root, rest) = path
                .split_first()
                .ok_or_else(|| ExpressionError::TypeMismatch("empty path".into()))?;
            let mut value = scope
                .resolve(root)
                .ok_or_else(|| ExpressionError::UnknownVariable(root.clone()))?;
            for segment in rest {
                value = value.get(segment).cloned().unwrap_or(Value::Null);
            }
            Ok(value)
        }
        Expr::Not(inner) => match eval(inner, scope)? {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            other => Err(ExpressionError::TypeMismatch(format!("cannot negate {other}"))),
        },
        Expr::Negate(inner) => match eval(inner, scope)? {
            Value::Number(n) => n
                .as_f64()
                .map(|f| number(-f))
                .ok_or_else(|| ExpressionError::TypeMismatch(format!("cannot negate {n}"))),
            other => Err(ExpressionError::TypeMismatch(format!(
                "cannot negate {other}"
            ))),
        },
        Expr::Binary { op, left, right } => match op {
            BinaryOp::And => {
                if !as_bool(eval(left, scope)?)? {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(as_bool(eval(right, scope)?)?))
            }
            BinaryOp::Or => {
                if as_bool(eval(left, scope)?)? {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(as_bool(eval(right, scope)?)?))
            }
            BinaryOp::Eq => Ok(Value::Bool(values_equal(
                &eval(left, scope)?,
                &eval(right, scope)?,
            ))),
            BinaryOp::NotEq => Ok(Value::Bool(!values_equal(
                &eval(left, scope)?,
                &eval(right, scope)?,
            ))),
            BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
                let ordering = compare(&eval(left, scope)?, &eval(right, scope)?)?;
                Ok(Value::Bool(match op {
                    BinaryOp::Lt => ordering.is_lt(),
                    BinaryOp::LtEq => ordering.is_le(),
                    BinaryOp::Gt => ordering.is_gt(),
                    _ => ordering.is_ge(),
                }))
            }
        },
    }
}

fn as_bool(value: Value) -> Result<bool, ExpressionError> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(ExpressionError::TypeMismatch(format!(
            "expected boolean operand, got {other}"
        ))),
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Result<std::cmp::Ordering, ExpressionError> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
            a.partial_cmp(&b)
                .ok_or_else(|| ExpressionError::TypeMismatch("cannot compare NaN".into()))
        }
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => Err(ExpressionError::TypeMismatch(format!(
            "cannot compare {left} with {right}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(value: Value) -> Variables {
        match value {
            Value::Object(map) => map,
            _ => Variables::new(),
        }
    }

    fn eval_str(expr: &str, scope: &Variables) -> Result<Value, ExpressionError> {
        SimpleExpressionEvaluator.evaluate(expr, scope)
    }

    #[test]
    fn test_literals() {
        let scope = Variables::new();
        assert_eq!(eval_str("42", &scope).unwrap(), json!(42));
        assert_eq!(eval_str("1.5", &scope).unwrap(), json!(1.5));
        assert_eq!(eval_str("'hi'", &scope).unwrap(), json!("hi"));
        assert_eq!(eval_str("\"a\\\"b\"", &scope).unwrap(), json!("a\"b"));
        assert_eq!(eval_str("null", &scope).unwrap(), Value::Null);
        assert_eq!(eval_str("${true}", &scope).unwrap(), json!(true));
    }

    #[test]
    fn test_comparisons_and_logic() {
        let scope = vars(json!({"amount": 1200, "approved": true, "tier": "gold"}));
        let evaluator = SimpleExpressionEvaluator;

        assert!(evaluator
            .evaluate_condition("${amount > 1000 && approved}", &scope)
            .unwrap());
        assert!(evaluator
            .evaluate_condition("amount <= 1200 || false", &scope)
            .unwrap());
        assert!(evaluator
            .evaluate_condition("tier == 'gold' && !(amount < 5)", &scope)
            .unwrap());
        assert!(!evaluator.evaluate_condition("amount != 1200", &scope).unwrap());
        assert!(evaluator.evaluate_condition("-amount < 0", &scope).unwrap());
    }

    #[test]
    fn test_dotted_paths() {
        let scope = vars(json!({"order": {"customer": {"vip": true}}}));
        assert_eq!(eval_str("order.customer.vip", &scope).unwrap(), json!(true));
        assert_eq!(eval_str("order.missing", &scope).unwrap(), Value::Null);
    }

    #[test]
    fn test_unknown_variable() {
        let scope = Variables::new();
        assert_eq!(
            eval_str("${missing == 1}", &scope),
            Err(ExpressionError::UnknownVariable("missing".into()))
        );
    }

    #[test]
    fn test_short_circuit_skips_unknown_variable() {
        let scope = Variables::new();
        assert_eq!(eval_str("false && missing", &scope).unwrap(), json!(false));
        assert_eq!(eval_str("true || missing", &scope).unwrap(), json!(true));
    }

    #[test]
    fn test_non_boolean_condition_rejected() {
        let scope = vars(json!({"amount": 3}));
        let err = SimpleExpressionEvaluator
            .evaluate_condition("${amount}", &scope)
            .unwrap_err();
        assert!(matches!(err, ExpressionError::NotBoolean { .. }));
    }

    #[test]
    fn test_syntax_errors() {
        let scope = Variables::new();
        assert!(matches!(
            eval_str("(1 == 1", &scope),
            Err(ExpressionError::Syntax { .. })
        ));
        assert!(matches!(
            eval_str("a = b", &scope),
            Err(ExpressionError::Syntax { .. })
        ));
        assert!(matches!(
            eval_str("1 2", &scope),
            Err(ExpressionError::Syntax { .. })
        ));
    }

    #[test]
    fn test_resolve_name() {
        let scope = vars(json!({"region": "eu"}));
        let evaluator = SimpleExpressionEvaluator;
        assert_eq!(evaluator.resolve_name("plain", &scope).unwrap(), "plain");
        assert_eq!(evaluator.resolve_name("${region}", &scope).unwrap(), "eu");
    }
}
