//! The value model
//!
//! A [`Value`] is a JSON-shaped document atom: null, boolean, number,
//! string, array, object, or set. Scalars are stored inline; compound values
//! sit behind cheap `Arc` handles with copy-on-write mutation, so values are
//! logically immutable during an evaluation.
//!
//! "Undefined" is deliberately *not* a variant. A register that may hold no
//! value is an `Option<Value>`; undefined can never leak into a document.

use crate::number::Number;
use crate::object::Object;
use crate::set::Set;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Bool(bool),
    Number(Number),
    String(Arc<str>),
    Array(Array),
    Object(Object),
    Set(Set),
}

/// An ordered sequence of values behind a copy-on-write handle.
#[derive(Clone, Debug, Default)]
pub struct Array {
    elems: Arc<Vec<Value>>,
}

impl Array {
    pub fn new() -> Self {
        Array::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        Array {
            elems: Arc::new(Vec::with_capacity(cap)),
        }
    }

    pub fn len(&self) -> usize {
        self.elems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.elems.get(idx)
    }

    /// Append an element. Forks the backing vector when the handle is shared.
    pub fn push(&mut self, v: Value) {
        Arc::make_mut(&mut self.elems).push(v);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.elems.iter()
    }

    pub fn as_slice(&self) -> &[Value] {
        &self.elems
    }
}

impl From<Vec<Value>> for Array {
    fn from(elems: Vec<Value>) -> Self {
        Array {
            elems: Arc::new(elems),
        }
    }
}

impl FromIterator<Value> for Array {
    fn from_iter<T: IntoIterator<Item = Value>>(iter: T) -> Self {
        Array {
            elems: Arc::new(iter.into_iter().collect()),
        }
    }
}

impl PartialEq for Array {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.elems, &other.elems) || self.as_slice() == other.as_slice()
    }
}

impl Value {
    pub fn string(s: impl Into<Arc<str>>) -> Value {
        Value::String(s.into())
    }

    pub fn int(n: i64) -> Value {
        Value::Number(Number::Int(n))
    }

    pub fn float(f: f64) -> Value {
        Value::Number(Number::Float(f))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Set(_) => "set",
        }
    }

    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_)
        )
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<Number> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Length of an array, object, set, or string (in characters).
    pub fn length(&self) -> Option<usize> {
        match self {
            Value::Array(a) => Some(a.len()),
            Value::Object(o) => Some(o.len()),
            Value::Set(s) => Some(s.len()),
            Value::String(s) => Some(s.chars().count()),
            _ => None,
        }
    }

    /// Build a value from parsed JSON.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::int(i)
                } else {
                    Value::float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::string(s.as_str()),
            serde_json::Value::Array(elems) => {
                Value::Array(elems.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (Value::string(k.as_str()), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Render to JSON. Sets become arrays; non-string object keys are
    /// rendered through their compact JSON form, since JSON keys must be
    /// strings.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(Number::Int(n)) => serde_json::Value::Number((*n).into()),
            Value::Number(Number::Float(f)) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.to_string()),
            Value::Array(a) => {
                serde_json::Value::Array(a.iter().map(Value::to_json).collect())
            }
            Value::Object(o) => {
                let mut map = serde_json::Map::with_capacity(o.len());
                for (k, v) in o.iter() {
                    let key = match k {
                        Value::String(s) => s.to_string(),
                        other => serde_json::to_string(&other.to_json())
                            .unwrap_or_else(|_| other.type_name().to_string()),
                    };
                    map.insert(key, v.to_json());
                }
                serde_json::Value::Object(map)
            }
            Value::Set(s) => {
                serde_json::Value::Array(s.iter().map(Value::to_json).collect())
            }
        }
    }
}

impl serde::Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(Number::Int(n)) => serializer.serialize_i64(*n),
            Value::Number(Number::Float(f)) => serializer.serialize_f64(*f),
            Value::String(s) => serializer.serialize_str(s),
            Value::Array(a) => serializer.collect_seq(a.iter()),
            Value::Set(s) => serializer.collect_seq(s.iter()),
            Value::Object(o) => {
                let mut map = serializer.serialize_map(Some(o.len()))?;
                for (k, v) in o.iter() {
                    match k {
                        Value::String(s) => map.serialize_entry(&**s, v)?,
                        other => {
                            let rendered = serde_json::to_string(&other.to_json())
                                .unwrap_or_else(|_| other.type_name().to_string());
                            map.serialize_entry(&rendered, v)?;
                        }
                    }
                }
                map.end()
            }
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a.table_equal(b),
            (Value::Set(a), Value::Set(b)) => a.table_equal(b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::int(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_value;

    #[test]
    fn test_structural_equality() {
        let a = Value::Array(vec![Value::int(1), Value::string("x")].into());
        let b = Value::Array(vec![Value::int(1), Value::string("x")].into());
        assert_eq!(a, b);
        assert_ne!(a, Value::Array(vec![Value::int(1)].into()));
    }

    #[test]
    fn test_equal_implies_equal_hash() {
        let pairs = [
            (Value::int(7), Value::float(7.0)),
            (Value::string("abc"), Value::string("abc")),
            (
                Value::Array(vec![Value::Null, Value::Bool(true)].into()),
                Value::Array(vec![Value::Null, Value::Bool(true)].into()),
            ),
        ];
        for (a, b) in pairs {
            assert_eq!(a, b);
            assert_eq!(hash_value(&a), hash_value(&b));
        }
    }

    #[test]
    fn test_length() {
        assert_eq!(Value::string("héllo").length(), Some(5));
        assert_eq!(Value::Array(vec![Value::Null].into()).length(), Some(1));
        assert_eq!(Value::Null.length(), None);
    }

    #[test]
    fn test_json_round_trip() {
        let json: serde_json::Value = serde_json::from_str(
            r#"{"a": [1, 2.5, "x", null, true], "b": {"nested": {}}, "c": -9}"#,
        )
        .unwrap();
        let v = Value::from_json(&json);
        assert_eq!(v.to_json(), json);
    }

    #[test]
    fn test_set_renders_as_array() {
        let mut s = Set::new();
        s.add(Value::int(1));
        let json = Value::Set(s).to_json();
        assert_eq!(json, serde_json::json!([1]));
    }

    #[test]
    fn test_large_int_preserved_through_json() {
        let json = serde_json::json!({"n": 9007199254740993i64});
        let v = Value::from_json(&json);
        assert_eq!(v.to_json(), json);
    }

    #[test]
    fn test_serialize_matches_to_json() {
        let json = serde_json::json!({"a": [1, "x", null], "b": {"c": 2.5}});
        let v = Value::from_json(&json);
        assert_eq!(serde_json::to_value(&v).unwrap(), v.to_json());
    }
}
