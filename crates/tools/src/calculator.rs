//! Calculator tool: evaluates arithmetic expressions.
//!
//! Grammar (lowest to highest precedence):
//!
//! ```text
//! sum     = product (('+' | '-') product)*
//! product = power (('*' | '/' | '%') power)*
//! power   = unary ('^' power)?
//! unary   = '-' unary | atom
//! atom    = NUMBER | '(' sum ')'
//! ```
//!
//! Evaluation failures are returned as `ToolError::ExecutionFailed`, which
//! the executor records as an error payload and routes as `ERROR`.

use async_trait::async_trait;
use std::iter::Peekable;
use std::str::Chars;
use superego_core::error::ToolError;
use superego_core::tool::{Tool, ToolResult};
use tracing::debug;

pub const TOOL_NAME: &str = "calculator";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CalcError {
    #[error("empty expression")]
    Empty,
    #[error("unexpected character '{0}'")]
    BadChar(char),
    #[error("malformed number '{0}'")]
    BadNumber(String),
    #[error("unexpected {0}")]
    Unexpected(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("result is not a finite number")]
    NotFinite,
}

pub struct CalculatorTool;

#[async_trait]
impl Tool for CalculatorTool {
    fn name(&self) -> &str {
        TOOL_NAME
    }

    fn description(&self) -> &str {
        "Evaluate an arithmetic expression. Supports + - * / % ^, parentheses and decimals."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "expression": {
                    "type": "string",
                    "description": "Expression to evaluate, e.g. '5*10' or '(2 + 3) ^ 2'"
                }
            },
            "required": ["expression"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let expression = arguments
            .get("expression")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ToolError::InvalidArguments("missing string field 'expression'".into())
            })?;

        let value = evaluate(expression).map_err(|e| ToolError::ExecutionFailed {
            tool_name: TOOL_NAME.into(),
            reason: e.to_string(),
        })?;
        debug!(%expression, value, "Calculator evaluated expression");

        Ok(ToolResult {
            call_id: String::new(),
            success: true,
            output: format_number(value),
            data: Some(serde_json::json!({ "value": value })),
        })
    }
}

/// Render whole numbers without a fractional part.
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

/// Evaluate an arithmetic expression.
pub fn evaluate(expression: &str) -> Result<f64, CalcError> {
    let tokens = lex(expression)?;
    if tokens.is_empty() {
        return Err(CalcError::Empty);
    }
    let mut cursor = Cursor { tokens: &tokens, at: 0 };
    let value = cursor.sum()?;
    if let Some(tok) = cursor.tokens.get(cursor.at) {
        return Err(CalcError::Unexpected(tok.describe()));
    }
    if !value.is_finite() {
        return Err(CalcError::NotFinite);
    }
    Ok(value)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Tok {
    Num(f64),
    Op(char),
    Open,
    Close,
}

impl Tok {
    fn describe(&self) -> String {
        match self {
            Tok::Num(n) => format!("number {n}"),
            Tok::Op(c) => format!("operator '{c}'"),
            Tok::Open => "'('".into(),
            Tok::Close => "')'".into(),
        }
    }
}

fn lex(input: &str) -> Result<Vec<Tok>, CalcError> {
    let mut chars: Peekable<Chars<'_>> = input.chars().peekable();
    let mut out = Vec::new();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '+' | '-' | '*' | '/' | '%' | '^' => {
                out.push(Tok::Op(c));
                chars.next();
            }
            'x' | '×' => {
                out.push(Tok::Op('*'));
                chars.next();
            }
            '(' => {
                out.push(Tok::Open);
                chars.next();
            }
            ')' => {
                out.push(Tok::Close);
                chars.next();
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut literal = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        literal.push(d);
                        chars.next();
                    } else if d == '_' || d == ',' {
                        chars.next();
                    } else {
                        break;
                    }
                }
                let n = literal
                    .parse::<f64>()
                    .map_err(|_| CalcError::BadNumber(literal.clone()))?;
                out.push(Tok::Num(n));
            }
            other => return Err(CalcError::BadChar(other)),
        }
    }

    Ok(out)
}

struct Cursor<'a> {
    tokens: &'a [Tok],
    at: usize,
}

impl Cursor<'_> {
    fn peek_op(&self) -> Option<char> {
        match self.tokens.get(self.at) {
            Some(Tok::Op(c)) => Some(*c),
            _ => None,
        }
    }

    fn next(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.at).copied();
        if tok.is_some() {
            self.at += 1;
        }
        tok
    }

    fn sum(&mut self) -> Result<f64, CalcError> {
        let mut acc = self.product()?;
        while let Some(op @ ('+' | '-')) = self.peek_op() {
            self.at += 1;
            let rhs = self.product()?;
            acc = if op == '+' { acc + rhs } else { acc - rhs };
        }
        Ok(acc)
    }

    fn product(&mut self) -> Result<f64, CalcError> {
        let mut acc = self.power()?;
        while let Some(op @ ('*' | '/' | '%')) = self.peek_op() {
            self.at += 1;
            let rhs = self.power()?;
            acc = match op {
                '*' => acc * rhs,
                _ if rhs == 0.0 => return Err(CalcError::DivisionByZero),
                '/' => acc / rhs,
                _ => acc % rhs,
            };
        }
        Ok(acc)
    }

    fn power(&mut self) -> Result<f64, CalcError> {
        let base = self.unary()?;
        if self.peek_op() == Some('^') {
            self.at += 1;
            let exponent = self.power()?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    fn unary(&mut self) -> Result<f64, CalcError> {
        if self.peek_op() == Some('-') {
            self.at += 1;
            return Ok(-self.unary()?);
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<f64, CalcError> {
        match self.next() {
            Some(Tok::Num(n)) => Ok(n),
            Some(Tok::Open) => {
                let inner = self.sum()?;
                match self.next() {
                    Some(Tok::Close) => Ok(inner),
                    Some(tok) => Err(CalcError::Unexpected(tok.describe())),
                    None => Err(CalcError::Unexpected("end of expression, expected ')'".into())),
                }
            }
            Some(tok) => Err(CalcError::Unexpected(tok.describe())),
            None => Err(CalcError::Unexpected("end of expression".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiplies() {
        assert_eq!(evaluate("5*10").unwrap(), 50.0);
        assert_eq!(evaluate("5 x 10").unwrap(), 50.0);
    }

    #[test]
    fn precedence_and_grouping() {
        assert_eq!(evaluate("2 + 3 * 4").unwrap(), 14.0);
        assert_eq!(evaluate("(2 + 3) * 4").unwrap(), 20.0);
        assert_eq!(evaluate("10 % 4 + 1").unwrap(), 3.0);
    }

    #[test]
    fn power_is_right_associative() {
        assert_eq!(evaluate("2 ^ 3 ^ 2").unwrap(), 512.0);
        assert_eq!(evaluate("-2 ^ 2").unwrap(), 4.0);
    }

    #[test]
    fn thousands_separators_are_ignored() {
        assert_eq!(evaluate("1,000 + 1_000").unwrap(), 2000.0);
    }

    #[test]
    fn errors() {
        assert_eq!(evaluate("1 / 0"), Err(CalcError::DivisionByZero));
        assert_eq!(evaluate("   "), Err(CalcError::Empty));
        assert_eq!(evaluate("2 $ 3"), Err(CalcError::BadChar('$')));
        assert!(matches!(evaluate("(1 + 2"), Err(CalcError::Unexpected(_))));
        assert!(matches!(evaluate("1.2.3"), Err(CalcError::BadNumber(_))));
    }

    #[tokio::test]
    async fn tool_returns_formatted_result() {
        let result = CalculatorTool
            .execute(serde_json::json!({"expression": "5*10"}))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output, "50");
        assert_eq!(result.data.unwrap()["value"], 50.0);
    }

    #[tokio::test]
    async fn tool_failure_is_an_error() {
        let err = CalculatorTool
            .execute(serde_json::json!({"expression": "1/0"}))
            .await
            .unwrap_err();
        match err {
            ToolError::ExecutionFailed { tool_name, reason } => {
                assert_eq!(tool_name, "calculator");
                assert!(reason.contains("division by zero"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn tool_rejects_missing_expression() {
        let err = CalculatorTool.execute(serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[test]
    fn decimals_are_kept() {
        assert_eq!(format_number(2.5), "2.5");
        assert_eq!(format_number(50.0), "50");
    }
}
