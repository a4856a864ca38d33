//! `${name}` references and step guard expressions.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;
use thiserror::Error;

use crate::error::{ClassifiedError, ErrorCode};

pub type Variables = BTreeMap<String, Value>;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Undefined variable: {0}")]
    UndefinedVariable(String),

    #[error("Malformed guard expression: {0}")]
    MalformedGuard(String),
}

impl From<TemplateError> for ClassifiedError {
    fn from(err: TemplateError) -> Self {
        match &err {
            TemplateError::UndefinedVariable(name) => {
                ClassifiedError::fatal(ErrorCode::UndefinedVariable, err.to_string())
                    .with_context("variable", name)
            }
            TemplateError::MalformedGuard(expr) => {
                ClassifiedError::fatal(ErrorCode::InvalidDefinition, err.to_string())
                    .with_context("guard", expr)
            }
        }
    }
}

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{\s*([A-Za-z_][A-Za-z0-9_\-]*(?:\.[A-Za-z0-9_\-]+)*)\s*\}")
            .expect("reference pattern is valid")
    })
}

/// Look up `name` or a dotted `name.path` (object keys or array indices).
pub fn lookup<'a>(variables: &'a Variables, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = variables.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Text form of a value: strings bare, everything else as JSON.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Substitute every reference. Unknown references are an error.
pub fn resolve(template: &str, variables: &Variables) -> Result<String, TemplateError> {
    let mut missing = None;
    let resolved = reference_pattern().replace_all(template, |caps: &Captures| {
        match lookup(variables, &caps[1]) {
            Some(value) => display_value(value),
            None => {
                missing.get_or_insert_with(|| caps[1].to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(name) => Err(TemplateError::UndefinedVariable(name)),
        None => Ok(resolved.into_owned()),
    }
}

/// Substitute references, treating unknown ones as empty.
fn resolve_lenient(template: &str, variables: &Variables) -> String {
    reference_pattern()
        .replace_all(template, |caps: &Captures| {
            lookup(variables, &caps[1])
                .map(display_value)
                .unwrap_or_default()
        })
        .into_owned()
}

/// Resolve templates inside a JSON value.
///
/// A string that is exactly one reference takes the referenced value as-is,
/// so numbers, lists and objects keep their type.
pub fn resolve_value(value: &Value, variables: &Variables) -> Result<Value, TemplateError> {
    match value {
        Value::String(s) => {
            if let Some(caps) = reference_pattern().captures(s) {
                if caps[0].len() == s.len() {
                    return lookup(variables, &caps[1])
                        .cloned()
                        .ok_or_else(|| TemplateError::UndefinedVariable(caps[1].to_string()));
                }
            }
            resolve(s, variables).map(Value::String)
        }
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(item, variables))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| resolve_value(v, variables).map(|v| (k.clone(), v)))
            .collect::<Result<serde_json::Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

/// Evaluate a guard.
///
/// Supported forms: `a == b`, `a != b`, `a contains b`, `!a` and bare `a`.
/// Operands are templates or quoted literals; undefined references are falsy.
pub fn evaluate_guard(expression: &str, variables: &Variables) -> Result<bool, TemplateError> {
    let expr = expression.trim();
    if expr.is_empty() {
        return Err(TemplateError::MalformedGuard(expression.to_string()));
    }

    for (op, eval) in [
        (" != ", Comparison::NotEqual),
        (" == ", Comparison::Equal),
        (" contains ", Comparison::Contains),
    ] {
        if let Some((left, right)) = expr.split_once(op) {
            if left.trim().is_empty() || right.trim().is_empty() {
                return Err(TemplateError::MalformedGuard(expression.to_string()));
            }
            let left = operand(left, variables);
            let right = operand(right, variables);
            return Ok(match eval {
                Comparison::Equal => left == right,
                Comparison::NotEqual => left != right,
                Comparison::Contains => contains(&left, &right, variables, expr),
            });
        }
    }

    if let Some(rest) = expr.strip_prefix('!') {
        return evaluate_guard(rest, variables).map(|v| !v);
    }

    Ok(truthy(&operand(expr, variables)))
}

enum Comparison {
    Equal,
    NotEqual,
    Contains,
}

fn operand(raw: &str, variables: &Variables) -> String {
    let raw = raw.trim();
    let unquoted = raw
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| raw.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
        .unwrap_or(raw);
    resolve_lenient(unquoted, variables)
}

/// List membership when the left side is a single list reference, substring otherwise.
fn contains(left: &str, right: &str, variables: &Variables, expr: &str) -> bool {
    let list = expr
        .split_once(" contains ")
        .and_then(|(raw, _)| reference_pattern().captures(raw.trim()))
        .and_then(|caps| lookup(variables, &caps[1]))
        .and_then(Value::as_array);
    match list {
        Some(items) => items.iter().any(|item| display_value(item) == right),
        None => left.contains(right),
    }
}

fn truthy(text: &str) -> bool {
    let text = text.trim();
    !(text.is_empty() || text == "false" || text == "0" || text == "null")
}
