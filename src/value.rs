//! Runtime values flowing through machines.
//!
//! `Value` is a superset of JSON: besides the JSON data kinds it can carry
//! `undefined`, dates, callables (raw implementations or built machines),
//! opaque by-reference handles and faults travelling through an exit.

use crate::definition::{Implementation, Machine};
use crate::exits::Exits;
use crate::provenance::Fault;
use crate::supervisor::{Env, Inputs};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value as JsonValue;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A runtime value. Owned trees, so never cyclic.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Date(DateTime<Utc>),
    List(Vec<Value>),
    /// Entries iterate and serialize in sorted key order.
    Dict(BTreeMap<String, Value>),
    /// A raw unit of work supplied where a lambda input is expected.
    Function(Implementation),
    /// A built machine definition (e.g. a synthesized lambda).
    Machine(Machine),
    /// An arbitrary by-reference handle. Only `Passthrough` accepts it untouched.
    Opaque(Arc<dyn Any + Send + Sync>),
    /// An error payload delivered through an exit.
    Fault(Arc<Fault>),
}

impl Value {
    /// Wrap a closure as a callable value.
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(Inputs, Exits, Env) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::Function(Arc::new(f))
    }

    /// Wrap any shareable value as an opaque handle.
    pub fn opaque<T: Any + Send + Sync>(value: T) -> Self {
        Self::Opaque(Arc::new(value))
    }

    /// Short type name used in validation messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(n) if n.is_nan() => "NaN",
            Self::Number(n) if n.is_infinite() => "Infinity",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Date(_) => "date",
            Self::List(_) => "list",
            Self::Dict(_) => "dictionary",
            Self::Function(_) => "function",
            Self::Machine(_) => "machine",
            Self::Opaque(_) => "opaque reference",
            Self::Fault(_) => "fault",
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Dict(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn as_machine(&self) -> Option<&Machine> {
        match self {
            Self::Machine(machine) => Some(machine),
            _ => None,
        }
    }

    pub fn as_fault(&self) -> Option<&Fault> {
        match self {
            Self::Fault(fault) => Some(fault.as_ref()),
            _ => None,
        }
    }

    /// Downcast an opaque handle.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Self::Opaque(inner) => inner.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Look up a key when this is a dictionary.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict().and_then(|entries| entries.get(key))
    }

    /// Convert to JSON, dropping anything JSON cannot represent.
    ///
    /// Returns `None` when the value itself has no JSON form (undefined,
    /// callables, opaque handles, faults, non-finite numbers). Such entries
    /// nested inside lists or dictionaries are omitted.
    pub fn to_json(&self) -> Option<JsonValue> {
        match self {
            Self::Null => Some(JsonValue::Null),
            Self::Bool(b) => Some(JsonValue::Bool(*b)),
            Self::Number(n) => json_number(*n),
            Self::String(s) => Some(JsonValue::String(s.clone())),
            Self::Date(d) => Some(JsonValue::String(iso_8601(d))),
            Self::List(items) => Some(JsonValue::Array(
                items.iter().filter_map(Value::to_json).collect(),
            )),
            Self::Dict(entries) => Some(JsonValue::Object(
                entries
                    .iter()
                    .filter_map(|(k, v)| v.to_json().map(|v| (k.clone(), v)))
                    .collect(),
            )),
            Self::Undefined
            | Self::Function(_)
            | Self::Machine(_)
            | Self::Opaque(_)
            | Self::Fault(_) => None,
        }
    }
}

/// ISO-8601 rendering with millisecond precision and a `Z` suffix.
pub fn iso_8601(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Render a number the way host numbers stringify: integral values carry no
/// fractional part.
pub fn format_number(n: f64) -> String {
    if n == 0.0 {
        "0".to_string()
    } else if n.fract() == 0.0 && n.is_finite() {
        format!("{n:.0}")
    } else {
        format!("{n}")
    }
}

fn json_number(n: f64) -> Option<JsonValue> {
    if !n.is_finite() {
        return None;
    }
    // 2^53: beyond this integral f64s no longer round-trip through i64 exactly.
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        return Some(JsonValue::from(n as i64));
    }
    serde_json::Number::from_f64(n).map(JsonValue::Number)
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => write!(f, "Undefined"),
            Self::Null => write!(f, "Null"),
            Self::Bool(b) => write!(f, "Bool({b})"),
            Self::Number(n) => write!(f, "Number({n})"),
            Self::String(s) => write!(f, "String({s:?})"),
            Self::Date(d) => write!(f, "Date({})", iso_8601(d)),
            Self::List(items) => f.debug_tuple("List").field(items).finish(),
            Self::Dict(entries) => f.debug_tuple("Dict").field(entries).finish(),
            Self::Function(_) => write!(f, "Function(..)"),
            Self::Machine(machine) => write!(f, "Machine({})", machine.identity()),
            Self::Opaque(_) => write!(f, "Opaque(..)"),
            Self::Fault(fault) => write!(f, "Fault({})", fault.code()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Date(a), Self::Date(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Dict(a), Self::Dict(b)) => a == b,
            (Self::Function(a), Self::Function(b)) => Arc::ptr_eq(a, b),
            (Self::Machine(a), Self::Machine(b)) => a.ptr_eq(b),
            (Self::Opaque(a), Self::Opaque(b)) => Arc::ptr_eq(a, b),
            (Self::Fault(a), Self::Fault(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

// ─── Conversions ──────────────────────────────────────────────

impl From<JsonValue> for Value {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(b),
            JsonValue::Number(n) => n.as_f64().map_or(Self::Null, Self::Number),
            JsonValue::String(s) => Self::String(s),
            JsonValue::Array(items) => Self::List(items.into_iter().map(Value::from).collect()),
            JsonValue::Object(entries) => Self::Dict(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Number(f64::from(n))
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(d: DateTime<Utc>) -> Self {
        Self::Date(d)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(entries: BTreeMap<String, Value>) -> Self {
        Self::Dict(entries)
    }
}

impl From<Machine> for Value {
    fn from(machine: Machine) -> Self {
        Self::Machine(machine)
    }
}

impl From<Fault> for Value {
    fn from(fault: Fault) -> Self {
        Self::Fault(Arc::new(fault))
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Self::Undefined
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_from_json_and_back() {
        let original = json!({"name": "Ada", "tags": ["x", "y"], "age": 36, "ratio": 0.5});
        let value = Value::from(original.clone());
        assert_eq!(value.get("age"), Some(&Value::Number(36.0)));
        assert_eq!(value.to_json(), Some(original));
    }

    #[test]
    fn test_to_json_drops_non_json_entries() {
        let mut entries = BTreeMap::new();
        entries.insert("keep".to_string(), Value::from(1));
        entries.insert("gone".to_string(), Value::Undefined);
        entries.insert("nan".to_string(), Value::Number(f64::NAN));
        entries.insert("handle".to_string(), Value::opaque(42u8));
        let value = Value::Dict(entries);
        assert_eq!(value.to_json(), Some(json!({"keep": 1})));
        assert_eq!(Value::Undefined.to_json(), None);
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(4.0), "4");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(4.5), "4.5");
        assert_eq!(format_number(-12.0), "-12");
    }

    #[test]
    fn test_iso_8601() {
        let date = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(iso_8601(&date), "2024-01-02T03:04:05.000Z");
    }

    #[test]
    fn test_opaque_identity_equality() {
        let a = Value::opaque(String::from("same"));
        let b = Value::opaque(String::from("same"));
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_eq!(a.downcast_ref::<String>().map(String::as_str), Some("same"));
    }

    #[test]
    fn test_type_names() {
        assert_eq!(Value::Number(f64::NAN).type_name(), "NaN");
        assert_eq!(Value::Number(f64::INFINITY).type_name(), "Infinity");
        assert_eq!(Value::from("x").type_name(), "string");
        assert_eq!(Value::Undefined.type_name(), "undefined");
    }
}
