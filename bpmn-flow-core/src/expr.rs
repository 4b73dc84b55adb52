//! Restricted condition-expression evaluator.
//!
//! Conditions are authored as strings like `${sum} > 10` or
//! `${decision} == "approved" and ${retries} < 3`. Evaluation is a template
//! pass followed by a small hand-written lexer + recursive-descent parser
//! over the grammar: `== != > >= < <= and or not + - * /`, parentheses,
//! string/number/boolean literals, and identifiers bound to the context.
//!
//! Label-only strings (no `${…}`, no operators) fall back to the affirmative
//! rule: `approved`, `yes`, `true`, `1` (case-insensitive) are true,
//! everything else is false.

use crate::context::Context;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("condition `{condition}` failed to evaluate: {reason}")]
pub struct ConditionError {
    pub condition: String,
    pub reason: String,
}

impl From<ConditionError> for crate::error::EngineError {
    fn from(err: ConditionError) -> Self {
        crate::error::EngineError::ConditionEvaluation {
            condition: err.condition,
            reason: err.reason,
        }
    }
}

/// Evaluate a raw condition string against a context.
pub fn evaluate_condition(raw: &str, ctx: &Context) -> Result<bool, ConditionError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(false);
    }

    if !trimmed.contains("${") && !has_operators(trimmed) {
        return Ok(is_affirmative(trimmed));
    }

    let substituted = substitute(trimmed, ctx);
    let tokens = lex(&substituted).map_err(|reason| ConditionError {
        condition: raw.to_string(),
        reason,
    })?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        ctx,
    };
    let value = parser.expression().map_err(|reason| ConditionError {
        condition: raw.to_string(),
        reason,
    })?;
    if parser.pos != parser.tokens.len() {
        return Err(ConditionError {
            condition: raw.to_string(),
            reason: "trailing input after expression".to_string(),
        });
    }
    Ok(truthy(&value))
}

/// Substitute `${path}` occurrences, preserving value typing: numbers and
/// booleans are inserted bare, other strings are inserted as quoted literals
/// so comparisons stay string-typed. Missing paths become the empty string
/// literal.
fn substitute(input: &str, ctx: &Context) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let path = after[..end].trim();
                out.push_str(&literal_for(ctx.get(path)));
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn literal_for(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "\"\"".to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => {
            if s.parse::<f64>().is_ok() || s == "true" || s == "false" {
                s.clone()
            } else {
                quote(s)
            }
        }
        Some(other) => quote(&serde_json::to_string(other).unwrap_or_default()),
    }
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn has_operators(s: &str) -> bool {
    if s.chars().any(|c| "=!<>+-*/()".contains(c)) {
        return true;
    }
    s.split_whitespace()
        .any(|w| matches!(w.to_lowercase().as_str(), "and" | "or" | "not"))
}

fn is_affirmative(s: &str) -> bool {
    let normalized = s.trim().trim_matches(|c| c == '"' || c == '\'').to_lowercase();
    matches!(normalized.as_str(), "approved" | "yes" | "true" | "1")
}

// ─── Lexer ────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
enum Tok {
    Num(f64),
    Str(String),
    Ident(String),
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    And,
    Or,
    Not,
}

fn lex(input: &str) -> Result<Vec<Tok>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '(' => {
                tokens.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Tok::RParen);
                i += 1;
            }
            '+' => {
                tokens.push(Tok::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Tok::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Tok::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Tok::Slash);
                i += 1;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Tok::Eq);
                    i += 2;
                } else {
                    return Err("single `=` is not an operator, use `==`".to_string());
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Tok::Ne);
                    i += 2;
                } else {
                    return Err("single `!` is not an operator, use `not`".to_string());
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
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Tok::Le);
                    i += 2;
                } else {
                    tokens.push(Tok::Lt);
                    i += 1;
                }
            }
            '"' | '\'' => {
                let open = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some('\\') => {
                            if let Some(&escaped) = chars.get(i + 1) {
                                s.push(escaped);
                                i += 2;
                            } else {
                                return Err("dangling escape in string literal".to_string());
                            }
                        }
                        Some(&ch) if ch == open => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => return Err("unterminated string literal".to_string()),
                    }
                }
                tokens.push(Tok::Str(s));
            }
            '0'..='9' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text
                    .parse::<f64>()
                    .map_err(|_| format!("bad number literal `{text}`"))?;
                tokens.push(Tok::Num(num));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.to_lowercase().as_str() {
                    "and" => tokens.push(Tok::And),
                    "or" => tokens.push(Tok::Or),
                    "not" => tokens.push(Tok::Not),
                    _ => tokens.push(Tok::Ident(word)),
                }
            }
            other => return Err(format!("unexpected character `{other}`")),
        }
    }
    Ok(tokens)
}

// ─── Parser / evaluator ───────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
enum CondValue {
    Bool(bool),
    Num(f64),
    Str(String),
}

fn truthy(value: &CondValue) -> bool {
    match value {
        CondValue::Bool(b) => *b,
        CondValue::Num(n) => *n != 0.0,
        CondValue::Str(s) => is_affirmative(s),
    }
}

fn numeric(value: &CondValue) -> Option<f64> {
    match value {
        CondValue::Num(n) => Some(*n),
        CondValue::Str(s) => s.trim().parse().ok(),
        CondValue::Bool(_) => None,
    }
}

fn display(value: &CondValue) -> String {
    match value {
        CondValue::Bool(b) => b.to_string(),
        CondValue::Num(n) => n.to_string(),
        CondValue::Str(s) => s.clone(),
    }
}

struct Parser<'a> {
    tokens: Vec<Tok>,
    pos: usize,
    ctx: &'a Context,
}

impl Parser<'_> {
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

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expression(&mut self) -> Result<CondValue, String> {
        let mut left = self.and_expr()?;
        while self.eat(&Tok::Or) {
            let right = self.and_expr()?;
            left = CondValue::Bool(truthy(&left) || truthy(&right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<CondValue, String> {
        let mut left = self.not_expr()?;
        while self.eat(&Tok::And) {
            let right = self.not_expr()?;
            left = CondValue::Bool(truthy(&left) && truthy(&right));
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<CondValue, String> {
        if self.eat(&Tok::Not) {
            let inner = self.not_expr()?;
            return Ok(CondValue::Bool(!truthy(&inner)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<CondValue, String> {
        let left = self.additive()?;
        let op = match self.peek() {
            Some(Tok::Eq) | Some(Tok::Ne) | Some(Tok::Gt) | Some(Tok::Ge) | Some(Tok::Lt)
            | Some(Tok::Le) => self.bump().ok_or("exhausted input")?,
            _ => return Ok(left),
        };
        let right = self.additive()?;
        let result = match op {
            Tok::Eq => values_equal(&left, &right),
            Tok::Ne => !values_equal(&left, &right),
            Tok::Gt => order(&left, &right)? == std::cmp::Ordering::Greater,
            Tok::Ge => order(&left, &right)? != std::cmp::Ordering::Less,
            Tok::Lt => order(&left, &right)? == std::cmp::Ordering::Less,
            Tok::Le => order(&left, &right)? != std::cmp::Ordering::Greater,
            _ => unreachable!("comparison operator"),
        };
        Ok(CondValue::Bool(result))
    }

    fn additive(&mut self) -> Result<CondValue, String> {
        let mut left = self.multiplicative()?;
        loop {
            if self.eat(&Tok::Plus) {
                let right = self.multiplicative()?;
                left = arith(&left, &right, "+", |a, b| a + b)?;
            } else if self.eat(&Tok::Minus) {
                let right = self.multiplicative()?;
                left = arith(&left, &right, "-", |a, b| a - b)?;
            } else {
                return Ok(left);
            }
        }
    }

    fn multiplicative(&mut self) -> Result<CondValue, String> {
        let mut left = self.unary()?;
        loop {
            if self.eat(&Tok::Star) {
                let right = self.unary()?;
                left = arith(&left, &right, "*", |a, b| a * b)?;
            } else if self.eat(&Tok::Slash) {
                let right = self.unary()?;
                left = arith(&left, &right, "/", |a, b| a / b)?;
            } else {
                return Ok(left);
            }
        }
    }

    fn unary(&mut self) -> Result<CondValue, String> {
        if self.eat(&Tok::Minus) {
            let inner = self.unary()?;
            let n = numeric(&inner).ok_or_else(|| "unary `-` needs a number".to_string())?;
            return Ok(CondValue::Num(-n));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<CondValue, String> {
        match self.bump() {
            Some(Tok::Num(n)) => Ok(CondValue::Num(n)),
            Some(Tok::Str(s)) => Ok(CondValue::Str(s)),
            Some(Tok::Ident(word)) => Ok(self.resolve_ident(&word)),
            Some(Tok::LParen) => {
                let inner = self.expression()?;
                if !self.eat(&Tok::RParen) {
                    return Err("missing closing parenthesis".to_string());
                }
                Ok(inner)
            }
            Some(other) => Err(format!("unexpected token {other:?}")),
            None => Err("unexpected end of expression".to_string()),
        }
    }

    /// Identifiers resolve through the context (dotted lookup); `true` and
    /// `false` are the boolean constants; missing names read as empty string.
    fn resolve_ident(&self, word: &str) -> CondValue {
        match word {
            "true" => return CondValue::Bool(true),
            "false" => return CondValue::Bool(false),
            _ => {}
        }
        match self.ctx.get(word) {
            Some(Value::Bool(b)) => CondValue::Bool(*b),
            Some(Value::Number(n)) => CondValue::Num(n.as_f64().unwrap_or(0.0)),
            Some(Value::String(s)) => CondValue::Str(s.clone()),
            Some(Value::Null) | None => CondValue::Str(String::new()),
            Some(other) => CondValue::Str(serde_json::to_string(other).unwrap_or_default()),
        }
    }
}

fn values_equal(a: &CondValue, b: &CondValue) -> bool {
    if let (CondValue::Bool(x), CondValue::Bool(y)) = (a, b) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (numeric(a), numeric(b)) {
        return x == y;
    }
    display(a) == display(b)
}

fn order(a: &CondValue, b: &CondValue) -> Result<std::cmp::Ordering, String> {
    if let (Some(x), Some(y)) = (numeric(a), numeric(b)) {
        return x
            .partial_cmp(&y)
            .ok_or_else(|| "incomparable numbers".to_string());
    }
    if let (CondValue::Str(x), CondValue::Str(y)) = (a, b) {
        return Ok(x.cmp(y));
    }
    Err(format!(
        "cannot order {} against {}",
        display(a),
        display(b)
    ))
}

fn arith(
    a: &CondValue,
    b: &CondValue,
    op: &str,
    f: impl Fn(f64, f64) -> f64,
) -> Result<CondValue, String> {
    match (numeric(a), numeric(b)) {
        (Some(x), Some(y)) => Ok(CondValue::Num(f(x, y))),
        _ => Err(format!("arithmetic `{op}` needs numeric operands")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(value: serde_json::Value) -> Context {
        match value {
            Value::Object(map) => Context::new(map),
            _ => panic!("fixture must be an object"),
        }
    }

    #[test]
    fn numeric_comparisons() {
        let c = ctx(json!({"sum": 12}));
        assert!(evaluate_condition("${sum} > 10", &c).unwrap());
        assert!(!evaluate_condition("${sum} > 12", &c).unwrap());
        assert!(evaluate_condition("${sum} >= 12", &c).unwrap());
        assert!(evaluate_condition("${sum} != 11", &c).unwrap());
    }

    #[test]
    fn string_equality_via_template() {
        let c = ctx(json!({"decision": "approved"}));
        assert!(evaluate_condition("${decision} == \"approved\"", &c).unwrap());
        assert!(!evaluate_condition("${decision} == \"rejected\"", &c).unwrap());
        assert!(evaluate_condition("${decision} != 'rejected'", &c).unwrap());
    }

    #[test]
    fn identifiers_bind_to_context() {
        let c = ctx(json!({"approved": true, "retries": 2}));
        assert!(evaluate_condition("approved and retries < 3", &c).unwrap());
        assert!(!evaluate_condition("approved and retries < 2", &c).unwrap());
        assert!(evaluate_condition("not missing_flag", &c).unwrap());
    }

    #[test]
    fn arithmetic_and_parens() {
        let c = ctx(json!({"a": 2, "b": 3}));
        assert!(evaluate_condition("${a} + ${b} == 5", &c).unwrap());
        assert!(evaluate_condition("(${a} + ${b}) * 2 > 9", &c).unwrap());
        assert!(evaluate_condition("${a} - ${b} < 0", &c).unwrap());
    }

    #[test]
    fn label_only_fallback() {
        let c = Context::default();
        assert!(evaluate_condition("approved", &c).unwrap());
        assert!(evaluate_condition("Yes", &c).unwrap());
        assert!(evaluate_condition("TRUE", &c).unwrap());
        assert!(evaluate_condition("1", &c).unwrap());
        assert!(!evaluate_condition("rejected", &c).unwrap());
        assert!(!evaluate_condition("Success Path", &c).unwrap());
        assert!(!evaluate_condition("", &c).unwrap());
    }

    #[test]
    fn missing_paths_substitute_empty() {
        let c = Context::default();
        assert!(evaluate_condition("${nope} == \"\"", &c).unwrap());
        assert!(!evaluate_condition("${nope} == \"x\"", &c).unwrap());
    }

    #[test]
    fn malformed_expressions_error() {
        let c = ctx(json!({"sum": 1}));
        let err = evaluate_condition("${sum} >", &c).unwrap_err();
        assert!(err.condition.contains("${sum}"));
        assert!(evaluate_condition("${sum} = 1", &c).is_err());
        assert!(evaluate_condition("(${sum} > 0", &c).is_err());
    }

    #[test]
    fn string_values_quote_safely() {
        let c = ctx(json!({"note": "he said \"hi\""}));
        assert!(evaluate_condition("${note} == 'he said \"hi\"'", &c).unwrap());
    }
}
