//! Exemplars: structural types represented as data and inferred from example values.
//!
//! ```text
//! example            exemplar
//! "hello"            Primitive(String)      (dates too)
//! 42                 Primitive(Number)
//! true               Primitive(Boolean)
//! {a: 1}             Dictionary { a: Number }     {} = any dictionary
//! [1]                List(Some(Number))           [] = any list
//! "*"                Wildcard                     any JSON-compatible value
//! "==="              Passthrough                  anything, by reference
//! "->" / function    Lambda(contract)
//! ```

use crate::coerce::HopPath;
use crate::error::ContractError;
use crate::lambda::LambdaContract;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const WILDCARD_SENTINEL: &str = "*";
pub const PASSTHROUGH_SENTINEL: &str = "===";
pub const LAMBDA_SENTINEL: &str = "->";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Primitive {
    String,
    Number,
    Boolean,
}

impl Primitive {
    pub fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
        }
    }
}

/// A structural type. Acyclic; built only by inference or derivation.
#[derive(Debug, Clone, PartialEq)]
pub enum Exemplar {
    Primitive(Primitive),
    /// Fields are kept sorted by key, whatever order the example declared them in.
    Dictionary(BTreeMap<String, Exemplar>),
    /// `None` is the generic list of JSON-compatible values.
    List(Option<Box<Exemplar>>),
    Wildcard,
    Passthrough,
    Lambda(Box<LambdaContract>),
}

impl Exemplar {
    pub fn string() -> Self {
        Self::Primitive(Primitive::String)
    }

    pub fn number() -> Self {
        Self::Primitive(Primitive::Number)
    }

    pub fn boolean() -> Self {
        Self::Primitive(Primitive::Boolean)
    }

    pub fn list_of(pattern: Exemplar) -> Self {
        Self::List(Some(Box::new(pattern)))
    }

    pub fn lambda(contract: LambdaContract) -> Self {
        Self::Lambda(Box::new(contract))
    }

    /// Infer an exemplar from a declared example.
    ///
    /// Strict: lists of more than one item, `null` and `undefined` are
    /// rejected, since they do not name a single structural pattern.
    pub fn infer(example: &Value) -> Result<Self, ContractError> {
        Self::infer_at(example, &HopPath::root())
    }

    pub(crate) fn infer_at(example: &Value, path: &HopPath) -> Result<Self, ContractError> {
        match example {
            Value::String(s) if s == PASSTHROUGH_SENTINEL => Ok(Self::Passthrough),
            Value::String(s) if s == WILDCARD_SENTINEL => Ok(Self::Wildcard),
            Value::String(s) if s == LAMBDA_SENTINEL => Ok(Self::lambda(LambdaContract::new())),
            Value::String(_) | Value::Date(_) => Ok(Self::string()),
            Value::Number(_) => Ok(Self::number()),
            Value::Bool(_) => Ok(Self::boolean()),
            Value::List(items) => match items.as_slice() {
                [] => Ok(Self::List(None)),
                [pattern] => Ok(Self::list_of(Self::infer_at(pattern, &path.index(0))?)),
                _ => Err(ContractError::AmbiguousListExample {
                    path: path.to_string(),
                    len: items.len(),
                }),
            },
            Value::Dict(entries) => entries
                .iter()
                .map(|(key, v)| Ok((key.clone(), Self::infer_at(v, &path.key(key))?)))
                .collect::<Result<BTreeMap<_, _>, ContractError>>()
                .map(Self::Dictionary),
            Value::Function(_) | Value::Machine(_) => Ok(Self::lambda(LambdaContract::new())),
            Value::Opaque(_) => Ok(Self::Passthrough),
            Value::Null | Value::Undefined | Value::Fault(_) => {
                Err(ContractError::UninferableExample {
                    path: path.to_string(),
                    found: example.type_name(),
                })
            }
        }
    }

    /// Infer the shape of a concrete runtime value.
    ///
    /// Never fails: the first list item stands for the pattern, sentinels are
    /// plain strings, and values without a shape infer to `Wildcard`.
    pub fn infer_lenient(value: &Value) -> Self {
        match value {
            Value::String(_) | Value::Date(_) => Self::string(),
            Value::Number(_) => Self::number(),
            Value::Bool(_) => Self::boolean(),
            Value::List(items) => Self::List(
                items
                    .first()
                    .map(|first| Box::new(Self::infer_lenient(first))),
            ),
            Value::Dict(entries) => Self::Dictionary(
                entries
                    .iter()
                    .filter(|(_, v)| !v.is_undefined())
                    .map(|(k, v)| (k.clone(), Self::infer_lenient(v)))
                    .collect(),
            ),
            Value::Function(_) | Value::Machine(_) => Self::lambda(LambdaContract::new()),
            Value::Opaque(_) => Self::Passthrough,
            Value::Null | Value::Undefined | Value::Fault(_) => Self::Wildcard,
        }
    }

    /// The default-for-type substituted by fallback coercion.
    pub fn base_value(&self) -> Value {
        match self {
            Self::Primitive(Primitive::String) => Value::String(String::new()),
            Self::Primitive(Primitive::Number) => Value::Number(0.0),
            Self::Primitive(Primitive::Boolean) => Value::Bool(false),
            Self::Dictionary(fields) => Value::Dict(
                fields
                    .iter()
                    .map(|(k, e)| (k.clone(), e.base_value()))
                    .filter(|(_, v)| !v.is_undefined())
                    .collect(),
            ),
            Self::List(_) => Value::List(Vec::new()),
            Self::Wildcard => Value::Null,
            Self::Passthrough | Self::Lambda(_) => Value::Undefined,
        }
    }

    /// Whether a declared key may be left `undefined`.
    pub fn permits_undefined(&self) -> bool {
        matches!(self, Self::Passthrough)
    }

    /// `{}` and `[]`: containers without a declared structure.
    pub fn is_generic(&self) -> bool {
        match self {
            Self::Dictionary(fields) => fields.is_empty(),
            Self::List(pattern) => pattern.is_none(),
            _ => false,
        }
    }

    pub fn is_lambda(&self) -> bool {
        matches!(self, Self::Lambda(_))
    }

    /// The per-item pattern of a list exemplar (`Wildcard` for a generic list).
    pub fn item_pattern(&self) -> Option<Exemplar> {
        match self {
            Self::List(Some(pattern)) => Some(pattern.as_ref().clone()),
            Self::List(None) => Some(Self::Wildcard),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Primitive(p) => p.name(),
            Self::Dictionary(_) => "dictionary",
            Self::List(_) => "list",
            Self::Wildcard => "JSON-compatible value",
            Self::Passthrough => "reference",
            Self::Lambda(_) => "lambda",
        }
    }
}

impl fmt::Display for Exemplar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primitive(p) => f.write_str(p.name()),
            Self::Dictionary(fields) => {
                f.write_str("{")?;
                for (i, (key, field)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}: {field}")?;
                }
                f.write_str("}")
            }
            Self::List(Some(pattern)) => write!(f, "[{pattern}]"),
            Self::List(None) => f.write_str("[]"),
            Self::Wildcard => f.write_str(WILDCARD_SENTINEL),
            Self::Passthrough => f.write_str(PASSTHROUGH_SENTINEL),
            Self::Lambda(_) => f.write_str(LAMBDA_SENTINEL),
        }
    }
}

// ─── Typeclass shortcuts ──────────────────────────────────────

/// Named shortcuts for exemplars that have no natural example value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Typeclass {
    Wildcard,
    Dictionary,
    Array,
    Passthrough,
    Lambda,
}

impl Typeclass {
    /// Accepts both the names and the sentinel spellings.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "*" | "json" | "wildcard" => Some(Self::Wildcard),
            "dictionary" | "{}" => Some(Self::Dictionary),
            "array" | "[]" => Some(Self::Array),
            "ref" | "===" | "passthrough" => Some(Self::Passthrough),
            "lambda" | "->" => Some(Self::Lambda),
            _ => None,
        }
    }

    pub fn desugar(self) -> Exemplar {
        match self {
            Self::Wildcard => Exemplar::Wildcard,
            Self::Dictionary => Exemplar::Dictionary(BTreeMap::new()),
            Self::Array => Exemplar::List(None),
            Self::Passthrough => Exemplar::Passthrough,
            Self::Lambda => Exemplar::lambda(LambdaContract::new()),
        }
    }
}
