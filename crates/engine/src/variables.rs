//! `${...}` placeholder resolution for task parameters.
//!
//! Two reference roots exist:
//! - `${input.path}` reads the trigger variables the execution was started with.
//! - `${task.output.path}` reads the output of an earlier task in the same run.
//!
//! Paths are made of `.key` and `[index]` segments; a numeric key also indexes
//! into an array. A string that is exactly one placeholder is replaced by the
//! referenced JSON value (type preserved); placeholders embedded in a longer
//! string are stringified. `$${` produces a literal `${`.

use std::fmt;

use serde_json::{Map, Value};
use thiserror::Error;

/// Reserved root naming the execution's trigger variables.
pub const INPUT_ROOT: &str = "input";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VariableError {
    #[error("malformed reference '{reference}': {reason}")]
    Malformed { reference: String, reason: String },

    /// The named task has not produced an output in this run (not yet run,
    /// or failed under `on_error = continue`).
    #[error("reference '{reference}' names task '{task}' which has no output")]
    UnknownTask { reference: String, task: String },

    #[error("reference '{reference}' has no value at '{path}'")]
    MissingField { reference: String, path: String },
}

/// What a reference is rooted at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Root {
    Input,
    Task(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// A parsed `${...}` placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub root: Root,
    /// Segments below the root (`output` already stripped for task roots).
    pub path: Vec<PathSegment>,
    raw: String,
}

/// Values visible to placeholders during one task's resolution.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    pub input: &'a Map<String, Value>,
    /// Completed task outputs keyed by task name.
    pub outputs: &'a Map<String, Value>,
}

impl<'a> Scope<'a> {
    pub fn new(input: &'a Map<String, Value>, outputs: &'a Map<String, Value>) -> Self {
        Self { input, outputs }
    }
}

pub(crate) fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl Reference {
    /// Parse the body of a placeholder, i.e. the text between `${` and `}`.
    pub fn parse(body: &str) -> Result<Self, VariableError> {
        let raw = body.trim();
        let malformed = |reason: &str| VariableError::Malformed {
            reference: format!("${{{raw}}}"),
            reason: reason.to_owned(),
        };

        let split = raw.find(|c: char| c == '.' || c == '[').unwrap_or(raw.len());
        let (root_name, mut rest) = raw.split_at(split);
        if root_name.is_empty() {
            return Err(malformed("missing task name"));
        }
        if !is_valid_name(root_name) {
            return Err(malformed("names may only contain letters, digits, '_' and '-'"));
        }

        let mut path = Vec::new();
        while !rest.is_empty() {
            if let Some(after) = rest.strip_prefix('.') {
                let end = after.find(|c: char| c == '.' || c == '[').unwrap_or(after.len());
                let key = &after[..end];
                if key.is_empty() {
                    return Err(malformed("empty path segment"));
                }
                path.push(PathSegment::Key(key.to_owned()));
                rest = &after[end..];
            } else if let Some(after) = rest.strip_prefix('[') {
                let end = after.find(']').ok_or_else(|| malformed("unclosed '['"))?;
                let index = after[..end]
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| malformed("array index must be a non-negative integer"))?;
                path.push(PathSegment::Index(index));
                rest = &after[end + 1..];
            } else {
                return Err(malformed("expected '.' or '[' after ']'"));
            }
        }

        let root = if root_name == INPUT_ROOT {
            Root::Input
        } else {
            match path.first() {
                Some(PathSegment::Key(key)) if key == "output" => {
                    path.remove(0);
                    Root::Task(root_name.to_owned())
                }
                _ => return Err(malformed("task references must look like task.output.field")),
            }
        };

        Ok(Self { root, path, raw: raw.to_owned() })
    }

    /// The task this reference reads from, if any.
    pub fn task(&self) -> Option<&str> {
        match &self.root {
            Root::Task(name) => Some(name),
            Root::Input => None,
        }
    }

    /// Resolve against `scope`, returning a copy of the referenced value.
    pub fn lookup(&self, scope: &Scope<'_>) -> Result<Value, VariableError> {
        let (mut current, offset) = match &self.root {
            Root::Task(task) => {
                let output = scope.outputs.get(task).ok_or_else(|| VariableError::UnknownTask {
                    reference: self.to_string(),
                    task: task.clone(),
                })?;
                (output, 0)
            }
            Root::Input => match self.path.first() {
                None => return Ok(Value::Object(scope.input.clone())),
                Some(PathSegment::Key(key)) => {
                    (scope.input.get(key).ok_or_else(|| self.missing(1))?, 1)
                }
                Some(PathSegment::Index(_)) => return Err(self.missing(1)),
            },
        };

        for (i, segment) in self.path.iter().enumerate().skip(offset) {
            current = step(current, segment).ok_or_else(|| self.missing(i + 1))?;
        }
        Ok(current.clone())
    }

    fn missing(&self, depth: usize) -> VariableError {
        VariableError::MissingField {
            reference: self.to_string(),
            path: render_path(&self.path[..depth]),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{{}}}", self.raw)
    }
}

fn step<'v>(value: &'v Value, segment: &PathSegment) -> Option<&'v Value> {
    match (value, segment) {
        (Value::Object(map), PathSegment::Key(key)) => map.get(key),
        (Value::Array(items), PathSegment::Index(i)) => items.get(*i),
        (Value::Array(items), PathSegment::Key(key)) => {
            key.parse::<usize>().ok().and_then(|i| items.get(i))
        }
        _ => None,
    }
}

fn render_path(path: &[PathSegment]) -> String {
    let mut out = String::new();
    for segment in path {
        match segment {
            PathSegment::Key(key) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(key);
            }
            PathSegment::Index(i) => out.push_str(&format!("[{i}]")),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Literal(String),
    Placeholder(Reference),
}

fn tokenize(input: &str) -> Result<Vec<Token>, VariableError> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut rest = input;

    while let Some(idx) = rest.find('$') {
        literal.push_str(&rest[..idx]);
        let tail = &rest[idx..];

        if let Some(after) = tail.strip_prefix("$${") {
            literal.push_str("${");
            rest = after;
        } else if let Some(after) = tail.strip_prefix("${") {
            let end = after.find('}').ok_or_else(|| VariableError::Malformed {
                reference: tail.to_owned(),
                reason: "missing closing '}'".to_owned(),
            })?;
            if !literal.is_empty() {
                tokens.push(Token::Literal(std::mem::take(&mut literal)));
            }
            tokens.push(Token::Placeholder(Reference::parse(&after[..end])?));
            rest = &after[end + 1..];
        } else {
            literal.push('$');
            rest = &tail[1..];
        }
    }

    literal.push_str(rest);
    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Resolve every placeholder in `params`, recursing into nested values.
/// Object keys are never rewritten.
pub fn resolve_parameters(
    params: &Map<String, Value>,
    scope: &Scope<'_>,
) -> Result<Map<String, Value>, VariableError> {
    params
        .iter()
        .map(|(key, value)| Ok((key.clone(), resolve_value(value, scope)?)))
        .collect()
}

pub fn resolve_value(value: &Value, scope: &Scope<'_>) -> Result<Value, VariableError> {
    match value {
        Value::String(s) => resolve_string(s, scope),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => resolve_parameters(map, scope).map(Value::Object),
        other => Ok(other.clone()),
    }
}

fn resolve_string(s: &str, scope: &Scope<'_>) -> Result<Value, VariableError> {
    let tokens = tokenize(s)?;

    if let [Token::Placeholder(reference)] = tokens.as_slice() {
        return reference.lookup(scope);
    }

    let mut out = String::with_capacity(s.len());
    for token in tokens {
        match token {
            Token::Literal(text) => out.push_str(&text),
            Token::Placeholder(reference) => match reference.lookup(scope)? {
                Value::String(text) => out.push_str(&text),
                other => out.push_str(&other.to_string()),
            },
        }
    }
    Ok(Value::String(out))
}

/// Every placeholder found anywhere inside `value`, in document order.
pub fn references_in(value: &Value) -> Result<Vec<Reference>, VariableError> {
    let mut found = Vec::new();
    collect_references(value, &mut found)?;
    Ok(found)
}

fn collect_references(value: &Value, found: &mut Vec<Reference>) -> Result<(), VariableError> {
    match value {
        Value::String(s) => {
            for token in tokenize(s)? {
                if let Token::Placeholder(reference) = token {
                    found.push(reference);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_references(item, found)?;
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_references(item, found)?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn fixtures() -> (Map<String, Value>, Map<String, Value>) {
        let input = map(json!({ "city": "Oslo", "ids": [10, 20] }));
        let outputs = map(json!({
            "fetch": { "url": "http://x", "status": 200, "items": [{ "id": "a" }, { "id": "b" }] },
            "parse-2": { "rows": 3 }
        }));
        (input, outputs)
    }

    #[test]
    fn whole_placeholder_keeps_json_type() {
        let (input, outputs) = fixtures();
        let scope = Scope::new(&input, &outputs);
        let params = map(json!({
            "url": "${fetch.output.url}",
            "status": "${fetch.output.status}",
            "first": "${fetch.output.items[0]}",
            "rows": "${parse-2.output.rows}",
        }));

        let resolved = resolve_parameters(&params, &scope).unwrap();
        assert_eq!(resolved["url"], json!("http://x"));
        assert_eq!(resolved["status"], json!(200));
        assert_eq!(resolved["first"], json!({ "id": "a" }));
        assert_eq!(resolved["rows"], json!(3));
    }

    #[test]
    fn embedded_placeholders_are_stringified() {
        let (input, outputs) = fixtures();
        let scope = Scope::new(&input, &outputs);
        let value = json!("GET ${fetch.output.url} -> ${fetch.output.status} in ${input.city}");
        assert_eq!(
            resolve_value(&value, &scope).unwrap(),
            json!("GET http://x -> 200 in Oslo")
        );
    }

    #[test]
    fn nested_structures_and_numeric_keys_resolve() {
        let (input, outputs) = fixtures();
        let scope = Scope::new(&input, &outputs);
        let value = json!({
            "list": ["${input.ids.1}", { "deep": "${fetch.output.items.1.id}" }],
            "n": 5,
        });
        assert_eq!(
            resolve_value(&value, &scope).unwrap(),
            json!({ "list": [20, { "deep": "b" }], "n": 5 })
        );
    }

    #[test]
    fn escaped_and_stray_dollars_stay_literal() {
        let (input, outputs) = fixtures();
        let scope = Scope::new(&input, &outputs);
        let value = json!("cost: $5, template: $${fetch.output.url}");
        assert_eq!(
            resolve_value(&value, &scope).unwrap(),
            json!("cost: $5, template: ${fetch.output.url}")
        );
    }

    #[test]
    fn whole_input_and_whole_output_are_addressable() {
        let (input, outputs) = fixtures();
        let scope = Scope::new(&input, &outputs);
        assert_eq!(resolve_value(&json!("${input}"), &scope).unwrap(), Value::Object(input.clone()));
        assert_eq!(
            resolve_value(&json!("${parse-2.output}"), &scope).unwrap(),
            json!({ "rows": 3 })
        );
    }

    #[test]
    fn unknown_task_names_the_reference() {
        let (input, outputs) = fixtures();
        let scope = Scope::new(&input, &outputs);
        let err = resolve_value(&json!("${later.output.x}"), &scope).unwrap_err();
        assert_eq!(
            err,
            VariableError::UnknownTask { reference: "${later.output.x}".into(), task: "later".into() }
        );
    }

    #[test]
    fn missing_field_reports_the_failing_path() {
        let (input, outputs) = fixtures();
        let scope = Scope::new(&input, &outputs);
        let err = resolve_value(&json!("${fetch.output.items[5].id}"), &scope).unwrap_err();
        assert_eq!(
            err,
            VariableError::MissingField {
                reference: "${fetch.output.items[5].id}".into(),
                path: "items[5]".into(),
            }
        );
    }

    #[test]
    fn malformed_references_are_rejected() {
        for bad in [
            "${fetch.output.url",
            "${}",
            "${fetch.url}",
            "${fetch.output..url}",
            "${fetch.output.items[x]}",
            "${fetch.output.items[0]x}",
            "${bad name.output}",
        ] {
            assert!(
                matches!(references_in(&json!(bad)), Err(VariableError::Malformed { .. })),
                "{bad} should be malformed"
            );
        }
    }

    #[test]
    fn references_in_collects_roots_in_order() {
        let refs = references_in(&json!({
            "a": "${first.output.x} and ${input.y}",
            "b": ["${second.output}"],
        }))
        .unwrap();
        let roots: Vec<Root> = refs.into_iter().map(|r| r.root).collect();
        assert_eq!(
            roots,
            vec![Root::Task("first".into()), Root::Input, Root::Task("second".into())]
        );
    }
}
