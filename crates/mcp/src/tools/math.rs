// Arithmetic expression evaluator

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;
use toolgate_core::registry::{json_schema_object, json_schema_string};
use toolgate_core::{Tool, ToolDescriptor};

#[derive(Debug, Error, PartialEq)]
pub enum MathError {
    #[error("Unexpected character '{0}' at position {1}")]
    UnexpectedChar(char, usize),

    #[error("Unexpected end of expression")]
    UnexpectedEnd,

    #[error("Unexpected token {0}")]
    UnexpectedToken(String),

    #[error("Unknown function or constant: {0}")]
    UnknownName(String),

    #[error("{name} expects {expected} argument(s), got {actual}")]
    Arity {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Result is not a finite number")]
    NotFinite,

    #[error("Expression nests deeper than {0} levels")]
    TooDeep(usize),

    #[error("Expression longer than {0} characters")]
    TooLong(usize),
}

/// Nesting bound for parentheses, calls and unary signs
const MAX_DEPTH: usize = 256;
const MAX_EXPRESSION_LEN: usize = 10_000;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Op(char),
    LParen,
    RParen,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<Token>, MathError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                // Exponent: 1e3, 2.5E-4
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| MathError::UnexpectedToken(text.clone()))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect::<String>().to_lowercase()));
            }
            '*' if chars.get(i + 1) == Some(&'*') => {
                tokens.push(Token::Op('^'));
                i += 2;
            }
            '+' | '-' | '*' | '/' | '%' | '^' => {
                tokens.push(Token::Op(c));
                i += 1;
            }
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
            other => return Err(MathError::UnexpectedChar(other, i)),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        self.position += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), MathError> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(MathError::UnexpectedToken(format!("{:?}", token))),
            None => Err(MathError::UnexpectedEnd),
        }
    }

    fn expression(&mut self) -> Result<f64, MathError> {
        let mut value = self.term()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek().cloned() {
            self.position += 1;
            let rhs = self.term()?;
            value = if op == '+' { value + rhs } else { value - rhs };
        }
        Ok(value)
    }

    fn term(&mut self) -> Result<f64, MathError> {
        let mut value = self.unary()?;
        while let Some(Token::Op(op @ ('*' | '/' | '%'))) = self.peek().cloned() {
            self.position += 1;
            let rhs = self.unary()?;
            value = match op {
                '*' => value * rhs,
                _ if rhs == 0.0 => return Err(MathError::DivisionByZero),
                '/' => value / rhs,
                _ => value % rhs,
            };
        }
        Ok(value)
    }

    // Every recursive path (parentheses, call arguments, signs, exponents)
    // passes through here, so this bounds the stack
    fn unary(&mut self) -> Result<f64, MathError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(MathError::TooDeep(MAX_DEPTH));
        }
        let value = self.signed();
        self.depth -= 1;
        value
    }

    fn signed(&mut self) -> Result<f64, MathError> {
        match self.peek() {
            Some(Token::Op('-')) => {
                self.position += 1;
                Ok(-self.unary()?)
            }
            Some(Token::Op('+')) => {
                self.position += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<f64, MathError> {
        let base = self.primary()?;
        if let Some(Token::Op('^')) = self.peek() {
            self.position += 1;
            // Right-associative; the exponent may carry its own sign
            let exponent = self.unary()?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<f64, MathError> {
        match self.next() {
            Some(Token::Number(value)) => Ok(value),
            Some(Token::LParen) => {
                let value = self.expression()?;
                self.expect(Token::RParen)?;
                Ok(value)
            }
            Some(Token::Ident(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.position += 1;
                    let mut args = Vec::new();
                    if let Some(Token::RParen) = self.peek() {
                        self.position += 1;
                    } else {
                        loop {
                            args.push(self.expression()?);
                            match self.next() {
                                Some(Token::Comma) => continue,
                                Some(Token::RParen) => break,
                                Some(token) => {
                                    return Err(MathError::UnexpectedToken(format!("{:?}", token)))
                                }
                                None => return Err(MathError::UnexpectedEnd),
                            }
                        }
                    }
                    call(&name, &args)
                } else {
                    constant(&name)
                }
            }
            Some(token) => Err(MathError::UnexpectedToken(format!("{:?}", token))),
            None => Err(MathError::UnexpectedEnd),
        }
    }
}

fn constant(name: &str) -> Result<f64, MathError> {
    match name {
        "pi" => Ok(std::f64::consts::PI),
        "e" => Ok(std::f64::consts::E),
        "tau" => Ok(std::f64::consts::TAU),
        other => Err(MathError::UnknownName(other.to_string())),
    }
}

fn call(name: &str, args: &[f64]) -> Result<f64, MathError> {
    let arity = |expected: usize| {
        if args.len() == expected {
            Ok(())
        } else {
            Err(MathError::Arity {
                name: name.to_string(),
                expected,
                actual: args.len(),
            })
        }
    };

    let unary: Option<fn(f64) -> f64> = match name {
        "sqrt" => Some(f64::sqrt),
        "abs" => Some(f64::abs),
        "sin" => Some(f64::sin),
        "cos" => Some(f64::cos),
        "tan" => Some(f64::tan),
        "asin" => Some(f64::asin),
        "acos" => Some(f64::acos),
        "atan" => Some(f64::atan),
        "ln" => Some(f64::ln),
        "log" | "log10" => Some(f64::log10),
        "log2" => Some(f64::log2),
        "exp" => Some(f64::exp),
        "floor" => Some(f64::floor),
        "ceil" => Some(f64::ceil),
        "round" => Some(f64::round),
        _ => None,
    };
    if let Some(f) = unary {
        arity(1)?;
        return Ok(f(args[0]));
    }

    match name {
        "pow" => {
            arity(2)?;
            Ok(args[0].powf(args[1]))
        }
        "min" | "max" if !args.is_empty() => {
            let fold = if name == "min" { f64::min } else { f64::max };
            Ok(args[1..].iter().copied().fold(args[0], fold))
        }
        "min" | "max" => Err(MathError::Arity {
            name: name.to_string(),
            expected: 1,
            actual: 0,
        }),
        other => Err(MathError::UnknownName(other.to_string())),
    }
}

/// Evaluate an arithmetic expression.
///
/// Supports `+ - * / % ^` (`**` as an alias for `^`), parentheses, unary
/// signs, the constants `pi`, `e`, `tau` and common functions.
pub fn evaluate(expression: &str) -> Result<f64, MathError> {
    if expression.len() > MAX_EXPRESSION_LEN {
        return Err(MathError::TooLong(MAX_EXPRESSION_LEN));
    }
    let mut parser = Parser {
        tokens: tokenize(expression)?,
        position: 0,
        depth: 0,
    };

    let value = parser.expression()?;
    if let Some(token) = parser.next() {
        return Err(MathError::UnexpectedToken(format!("{:?}", token)));
    }
    if !value.is_finite() {
        return Err(MathError::NotFinite);
    }
    Ok(value)
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

#[derive(Debug, Deserialize)]
struct MathArgs {
    expression: String,
}

/// Tool to evaluate arithmetic
pub struct MathTool;

#[async_trait::async_trait]
impl Tool for MathTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "math".to_string(),
            description: "Evaluate an arithmetic expression with + - * / % ^, parentheses and functions such as sqrt, sin, log, min, max.".to_string(),
            parameters: json_schema_object(
                serde_json::json!({
                    "expression": json_schema_string("Expression to evaluate, e.g. (2 + 3) * sqrt(16)")
                }),
                vec!["expression"],
            ),
        }
    }

    async fn execute(&self, params: serde_json::Value) -> Result<String> {
        let args: MathArgs = serde_json::from_value(params).context("Invalid arguments for math")?;
        let value = evaluate(&args.expression)
            .with_context(|| format!("Cannot evaluate '{}'", args.expression))?;
        Ok(format_number(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_precedence_and_associativity() {
        assert_eq!(evaluate("2 + 3 * 4").unwrap(), 14.0);
        assert_eq!(evaluate("(2 + 3) * 4").unwrap(), 20.0);
        assert_eq!(evaluate("2 ^ 3 ^ 2").unwrap(), 512.0);
        assert_eq!(evaluate("2 ** 10").unwrap(), 1024.0);
        assert_eq!(evaluate("-2 ^ 2").unwrap(), -4.0);
        assert_eq!(evaluate("2 ^ -1").unwrap(), 0.5);
        assert_eq!(evaluate("10 - 4 - 3").unwrap(), 3.0);
        assert_eq!(evaluate("17 % 5").unwrap(), 2.0);
        assert_eq!(evaluate("1.5e3 / 3").unwrap(), 500.0);
    }

    #[test]
    fn test_functions_and_constants() {
        assert_eq!(evaluate("sqrt(16) + abs(-2)").unwrap(), 6.0);
        assert_eq!(evaluate("max(1, 7, 3) - min(4, 2)").unwrap(), 5.0);
        assert_eq!(evaluate("pow(2, 8)").unwrap(), 256.0);
        assert!((evaluate("sin(pi / 2)").unwrap() - 1.0).abs() < 1e-12);
        assert!((evaluate("log(1000)").unwrap() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_errors() {
        assert_eq!(evaluate("1 / 0"), Err(MathError::DivisionByZero));
        assert_eq!(evaluate("2 +"), Err(MathError::UnexpectedEnd));
        assert_eq!(evaluate("foo(1)"), Err(MathError::UnknownName("foo".to_string())));
        assert!(matches!(evaluate("sqrt(1, 2)"), Err(MathError::Arity { .. })));
        assert!(matches!(evaluate("2 $ 3"), Err(MathError::UnexpectedChar('$', 2))));
        assert!(matches!(evaluate("(1 + 2"), Err(MathError::UnexpectedEnd)));
        assert!(matches!(evaluate("1 2"), Err(MathError::UnexpectedToken(_))));
        assert_eq!(evaluate("sqrt(-1)"), Err(MathError::NotFinite));
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let nested = format!("{}1{}", "(".repeat(100_000), ")".repeat(100_000));
        assert_eq!(evaluate(&nested), Err(MathError::TooLong(MAX_EXPRESSION_LEN)));

        let parens = format!("{}1{}", "(".repeat(1_000), ")".repeat(1_000));
        assert_eq!(evaluate(&parens), Err(MathError::TooDeep(MAX_DEPTH)));

        let signs = format!("{}1", "-".repeat(5_000));
        assert_eq!(evaluate(&signs), Err(MathError::TooDeep(MAX_DEPTH)));

        let calls = format!("{}1{}", "abs(".repeat(1_000), ")".repeat(1_000));
        assert_eq!(evaluate(&calls), Err(MathError::TooDeep(MAX_DEPTH)));

        let ok = format!("{}2{}", "(".repeat(100), ")".repeat(100));
        assert_eq!(evaluate(&ok), Ok(2.0));
    }

    #[tokio::test]
    async fn test_tool_formats_integers() {
        let tool = MathTool;
        assert_eq!(tool.execute(json!({"expression": "6 * 7"})).await.unwrap(), "42");
        assert_eq!(tool.execute(json!({"expression": "1 / 4"})).await.unwrap(), "0.25");
        assert!(tool.execute(json!({"expression": "1 / 0"})).await.is_err());
    }
}
