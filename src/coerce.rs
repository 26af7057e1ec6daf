//! Coercion and validation of runtime values against exemplars.
//!
//! Coercion walks the value and the exemplar together. Every mismatch is
//! recorded with its hop path instead of aborting, so one pass reports every
//! problem. A failing node is replaced by its exemplar's base value; whether
//! that substitution is the result or only a placeholder depends on
//! `allow_base_fallback`.

use crate::exemplar::{Exemplar, Primitive};
use crate::value::{format_number, iso_8601, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Nesting ceiling for generic values when no configuration is supplied.
pub const DEFAULT_MAX_VALUE_DEPTH: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoerceOptions {
    /// Substitute base values for failures instead of reporting them.
    pub allow_base_fallback: bool,
    pub max_value_depth: usize,
}

impl CoerceOptions {
    pub fn strict() -> Self {
        Self {
            allow_base_fallback: false,
            max_value_depth: DEFAULT_MAX_VALUE_DEPTH,
        }
    }

    pub fn lenient() -> Self {
        Self {
            allow_base_fallback: true,
            ..Self::strict()
        }
    }

    pub fn with_max_value_depth(mut self, depth: usize) -> Self {
        self.max_value_depth = depth;
        self
    }
}

impl Default for CoerceOptions {
    fn default() -> Self {
        Self::strict()
    }
}

// ---------------------------------------------------------------------------
// Hop paths
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Hop {
    Key(String),
    Index(usize),
}

/// Location of a node inside a value: `a.b[2].c`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct HopPath(Vec<Hop>);

impl HopPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn key(&self, key: &str) -> Self {
        let mut hops = self.0.clone();
        hops.push(Hop::Key(key.to_string()));
        Self(hops)
    }

    pub fn index(&self, index: usize) -> Self {
        let mut hops = self.0.clone();
        hops.push(Hop::Index(index));
        Self(hops)
    }
}

impl fmt::Display for HopPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("<root>");
        }
        for (i, hop) in self.0.iter().enumerate() {
            match hop {
                Hop::Key(key) if i == 0 => f.write_str(key)?,
                Hop::Key(key) => write!(f, ".{key}")?,
                Hop::Index(index) => write!(f, "[{index}]")?,
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationIssue {
    pub path: HopPath,
    pub expected: String,
    pub actual: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(
        path: HopPath,
        expected: impl Into<String>,
        actual: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            path,
            expected: expected.into(),
            actual: actual.into(),
            message: message.into(),
        }
    }

    fn mismatch(path: &HopPath, exemplar: &Exemplar, value: &Value) -> Self {
        let expected = exemplar.kind_name();
        let actual = value.type_name();
        Self::new(
            path.clone(),
            expected,
            actual,
            format!("expected {expected}, got {actual}"),
        )
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}`: {}", self.path, self.message)
    }
}

/// Every issue found in one coercion pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, issue: ValidationIssue) {
        self.issues.push(issue);
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.issues.extend(other.issues);
    }

    pub fn issues(&self) -> &[ValidationIssue] {
        &self.issues
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    /// Rendered paths of the failing nodes, in discovery order.
    pub fn paths(&self) -> Vec<String> {
        self.issues.iter().map(|i| i.path.to_string()).collect()
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.issues.is_empty() {
            return f.write_str("no issues");
        }
        for (i, issue) in self.issues.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{issue}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Coerce `value` to conform to `exemplar`.
pub fn coerce(
    value: Value,
    exemplar: &Exemplar,
    options: &CoerceOptions,
) -> Result<Value, ValidationReport> {
    coerce_at(value, exemplar, options, &HopPath::root())
}

/// Coerce with issue paths rooted at `path`.
pub fn coerce_at(
    value: Value,
    exemplar: &Exemplar,
    options: &CoerceOptions,
    path: &HopPath,
) -> Result<Value, ValidationReport> {
    let mut coercer = Coercer::new(options);
    let coerced = coercer.coerce(value, exemplar, path, 0);
    if coercer.report.is_empty() || options.allow_base_fallback {
        Ok(coerced)
    } else {
        Err(coercer.report)
    }
}

struct Coercer<'a> {
    options: &'a CoerceOptions,
    report: ValidationReport,
}

impl<'a> Coercer<'a> {
    fn new(options: &'a CoerceOptions) -> Self {
        Self {
            options,
            report: ValidationReport::new(),
        }
    }

    fn fail(&mut self, value: &Value, exemplar: &Exemplar, path: &HopPath) -> Value {
        self.report
            .push(ValidationIssue::mismatch(path, exemplar, value));
        exemplar.base_value()
    }

    fn too_deep(&mut self, exemplar: &Exemplar, path: &HopPath) -> Value {
        let ceiling = self.options.max_value_depth;
        self.report.push(ValidationIssue::new(
            path.clone(),
            exemplar.kind_name(),
            "deeply nested value",
            format!("value nests deeper than {ceiling} levels"),
        ));
        exemplar.base_value()
    }

    fn coerce(&mut self, value: Value, exemplar: &Exemplar, path: &HopPath, depth: usize) -> Value {
        if depth > self.options.max_value_depth {
            return self.too_deep(exemplar, path);
        }
        match exemplar {
            Exemplar::Passthrough => value,
            Exemplar::Primitive(primitive) => match coerce_primitive(&value, *primitive) {
                Some(coerced) => coerced,
                None => self.fail(&value, exemplar, path),
            },
            Exemplar::Lambda(_) => match value {
                Value::Function(_) | Value::Machine(_) => value,
                other => self.fail(&other, exemplar, path),
            },
            Exemplar::Wildcard => match self.sanitize(value.clone(), path, depth) {
                Some(clean) => clean,
                None => self.fail(&value, exemplar, path),
            },
            Exemplar::Dictionary(fields) if fields.is_empty() => match value {
                Value::Dict(entries) => Value::Dict(self.sanitize_entries(entries, path, depth)),
                other => self.fail(&other, exemplar, path),
            },
            Exemplar::Dictionary(fields) => match value {
                Value::Dict(mut entries) => {
                    let mut out = BTreeMap::new();
                    for (key, field) in fields {
                        let hop = path.key(key);
                        let coerced = match entries.remove(key) {
                            None | Some(Value::Undefined) if field.permits_undefined() => continue,
                            None | Some(Value::Undefined) => {
                                self.fail(&Value::Undefined, field, &hop)
                            }
                            Some(inner) => self.coerce(inner, field, &hop, depth + 1),
                        };
                        if !coerced.is_undefined() {
                            out.insert(key.clone(), coerced);
                        }
                    }
                    Value::Dict(out)
                }
                other => self.fail(&other, exemplar, path),
            },
            Exemplar::List(None) => match value {
                Value::List(items) => Value::List(self.sanitize_items(items, path, depth)),
                other => self.fail(&other, exemplar, path),
            },
            Exemplar::List(Some(pattern)) => match value {
                Value::List(items) => Value::List(
                    items
                        .into_iter()
                        .enumerate()
                        .map(|(i, item)| self.coerce(item, pattern, &path.index(i), depth + 1))
                        .filter(|item| !item.is_undefined())
                        .collect(),
                ),
                other => self.fail(&other, exemplar, path),
            },
        }
    }

    /// Deep-copy the JSON-compatible part of a value. `None` when the value
    /// itself has no JSON form.
    fn sanitize(&mut self, value: Value, path: &HopPath, depth: usize) -> Option<Value> {
        if depth > self.options.max_value_depth {
            return Some(self.too_deep(&Exemplar::Wildcard, path));
        }
        match value {
            Value::Null | Value::Bool(_) | Value::String(_) => Some(value),
            Value::Number(n) => n.is_finite().then_some(value),
            Value::Date(d) => Some(Value::String(iso_8601(&d))),
            Value::List(items) => Some(Value::List(self.sanitize_items(items, path, depth))),
            Value::Dict(entries) => Some(Value::Dict(self.sanitize_entries(entries, path, depth))),
            Value::Undefined
            | Value::Function(_)
            | Value::Machine(_)
            | Value::Opaque(_)
            | Value::Fault(_) => None,
        }
    }

    fn sanitize_items(&mut self, items: Vec<Value>, path: &HopPath, depth: usize) -> Vec<Value> {
        items
            .into_iter()
            .enumerate()
            .filter_map(|(i, item)| self.sanitize(item, &path.index(i), depth + 1))
            .collect()
    }

    fn sanitize_entries(
        &mut self,
        entries: BTreeMap<String, Value>,
        path: &HopPath,
        depth: usize,
    ) -> BTreeMap<String, Value> {
        entries
            .into_iter()
            .filter_map(|(key, v)| {
                let hop = path.key(&key);
                self.sanitize(v, &hop, depth + 1).map(|clean| (key, clean))
            })
            .collect()
    }
}

fn coerce_primitive(value: &Value, primitive: Primitive) -> Option<Value> {
    match primitive {
        Primitive::String => match value {
            Value::String(_) => Some(value.clone()),
            Value::Number(n) if n.is_finite() => Some(Value::String(format_number(*n))),
            Value::Bool(b) => Some(Value::String(b.to_string())),
            Value::Date(d) => Some(Value::String(iso_8601(d))),
            _ => None,
        },
        Primitive::Number => match value {
            Value::Number(n) if n.is_finite() => Some(value.clone()),
            Value::String(s) => parse_number(s).map(Value::Number),
            Value::Bool(b) => Some(Value::Number(if *b { 1.0 } else { 0.0 })),
            _ => None,
        },
        Primitive::Boolean => match value {
            Value::Bool(_) => Some(value.clone()),
            Value::Number(n) if *n == 1.0 => Some(Value::Bool(true)),
            Value::Number(n) if *n == 0.0 => Some(Value::Bool(false)),
            Value::String(s) => parse_bool(s).map(Value::Bool),
            _ => None,
        },
    }
}

fn parse_number(s: &str) -> Option<f64> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|n| n.is_finite())
}

fn parse_bool(s: &str) -> Option<bool> {
    let trimmed = s.trim();
    if trimmed.eq_ignore_ascii_case("true") || trimmed == "1" {
        Some(true)
    } else if trimmed.eq_ignore_ascii_case("false") || trimmed == "0" {
        Some(false)
    } else {
        None
    }
}
