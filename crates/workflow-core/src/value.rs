//! The value domain shared by the state store and the expression engine.
//!
//! Per the design notes, state is represented as a tagged sum of
//! `Scalar|Sequence|Mapping|Null` rather than a dynamically-typed dict tree.
//! `Value` is a thin newtype over `serde_json::Value` so it round-trips
//! through YAML workflow files, JSON-serialized RPC payloads, and the
//! expression engine's literal syntax with a single representation.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// A JSON-serializable runtime value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Value(pub Json);

impl Value {
    pub fn null() -> Self {
        Value(Json::Null)
    }

    pub fn bool(b: bool) -> Self {
        Value(Json::Bool(b))
    }

    pub fn number(n: f64) -> Self {
        Value(serde_json::Number::from_f64(n).map(Json::Number).unwrap_or(Json::Null))
    }

    pub fn string(s: impl Into<String>) -> Self {
        Value(Json::String(s.into()))
    }

    pub fn array(items: Vec<Value>) -> Self {
        Value(Json::Array(items.into_iter().map(|v| v.0).collect()))
    }

    pub fn object(map: BTreeMap<String, Value>) -> Self {
        let mut obj = serde_json::Map::new();
        for (k, v) in map {
            obj.insert(k, v.0);
        }
        Value(Json::Object(obj))
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.0.as_bool()
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.0.as_f64()
    }

    pub fn as_str(&self) -> Option<&str> {
        self.0.as_str()
    }

    pub fn as_array(&self) -> Option<&Vec<Json>> {
        self.0.as_array()
    }

    pub fn as_object(&self) -> Option<&serde_json::Map<String, Json>> {
        self.0.as_object()
    }

    /// JS-style truthiness: `null`, `false`, `0`, `""`, and empty arrays are
    /// falsy; everything else (including empty objects) is truthy.
    pub fn is_truthy(&self) -> bool {
        match &self.0 {
            Json::Null => false,
            Json::Bool(b) => *b,
            Json::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
            Json::String(s) => !s.is_empty(),
            Json::Array(a) => !a.is_empty(),
            Json::Object(_) => true,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match &self.0 {
            Json::Null => "null",
            Json::Bool(_) => "boolean",
            Json::Number(_) => "number",
            Json::String(_) => "string",
            Json::Array(_) => "array",
            Json::Object(_) => "object",
        }
    }

    /// Get a field by key if this value is an object.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.0.get(key).cloned().map(Value)
    }

    /// Get an element by index if this value is an array.
    pub fn index(&self, i: usize) -> Option<Value> {
        self.0.get(i).cloned().map(Value)
    }

    pub fn len(&self) -> Option<usize> {
        match &self.0 {
            Json::Array(a) => Some(a.len()),
            Json::String(s) => Some(s.chars().count()),
            Json::Object(o) => Some(o.len()),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len().map(|n| n == 0).unwrap_or(true)
    }

    /// Well-defined template printer (§4.3): numbers as canonical decimal,
    /// booleans lowercase, null as `null`, mappings/sequences as JSON.
    pub fn to_template_string(&self) -> String {
        match &self.0 {
            Json::Null => "null".to_string(),
            Json::Bool(b) => b.to_string(),
            Json::Number(n) => format_number(n),
            Json::String(s) => s.clone(),
            Json::Array(_) | Json::Object(_) => {
                serde_json::to_string(&self.0).unwrap_or_default()
            }
        }
    }

    pub fn from_json(json: Json) -> Self {
        Value(json)
    }

    pub fn into_json(self) -> Json {
        self.0
    }
}

fn format_number(n: &serde_json::Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(f) = n.as_f64() {
        if f.fract() == 0.0 && f.abs() < 1e15 {
            return format!("{}", f as i64);
        }
        return format!("{f}");
    }
    n.to_string()
}

impl From<Json> for Value {
    fn from(json: Json) -> Self {
        Value(json)
    }
}

impl From<Value> for Json {
    fn from(value: Value) -> Self {
        value.0
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::string(s)
    }
}

/// Partial ordering used by comparison operators; numbers and strings are
/// ordered natively, everything else is only equal to itself.
pub fn partial_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (&a.0, &b.0) {
        (Json::Number(x), Json::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Json::String(x), Json::String(y)) => x.partial_cmp(y),
        (Json::Bool(x), Json::Bool(y)) => x.partial_cmp(y),
        _ => None,
    }
}

/// Loose equality matching the `==` operator: numbers compare by value,
/// everything else structurally.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (&a.0, &b.0) {
        (Json::Number(x), Json::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a.0 == b.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness_matches_js_semantics() {
        assert!(!Value::null().is_truthy());
        assert!(!Value::bool(false).is_truthy());
        assert!(!Value::number(0.0).is_truthy());
        assert!(!Value::string("").is_truthy());
        assert!(!Value::array(vec![]).is_truthy());
        assert!(Value::number(1.0).is_truthy());
        assert!(Value::string("x").is_truthy());
    }

    #[test]
    fn template_string_formats_numbers_canonically() {
        assert_eq!(Value::number(15.0).to_template_string(), "15");
        assert_eq!(Value::number(1.5).to_template_string(), "1.5");
        assert_eq!(Value::bool(true).to_template_string(), "true");
        assert_eq!(Value::null().to_template_string(), "null");
    }

    #[test]
    fn template_string_serializes_collections_as_json() {
        let arr = Value::array(vec![Value::number(1.0), Value::number(2.0)]);
        assert_eq!(arr.to_template_string(), "[1,2]");
    }

    #[test]
    fn loose_equality_compares_numbers_by_value() {
        assert!(values_equal(&Value::number(1.0), &Value::number(1.0)));
        assert!(!values_equal(&Value::number(1.0), &Value::string("1")));
    }
}
