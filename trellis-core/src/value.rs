//! Attribute values.
//!
//! Every tracked attribute holds a [`Value`]: a tagged tree of primitives,
//! sequences, associative maps and named records. Keeping values dynamic
//! lets one registry track heterogeneous attributes and lets the equality
//! comparator decide structurally whether a recomputation changed anything.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A dynamically typed attribute value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Seq(Vec<Value>),
    Map(IndexMap<String, Value>),
    Record {
        name: String,
        fields: IndexMap<String, Value>,
    },
}

impl Value {
    /// Build a record value.
    pub fn record<I, K>(name: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Value::Record {
            name: name.into(),
            fields: fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Build a map value.
    pub fn map<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Value::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Maps and records are the values an object wrapper nests.
    pub fn is_object(&self) -> bool {
        matches!(self, Value::Map(_) | Value::Record { .. })
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Ints widen to floats.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Fields of a map or record.
    pub fn fields(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Map(fields) | Value::Record { fields, .. } => Some(fields),
            _ => None,
        }
    }

    /// Convert into a JSON value. Records become objects; non-finite floats
    /// become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Seq(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(fields) | Value::Record { fields, .. } => serde_json::Value::Object(
                fields.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => {
                Value::Seq(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(fields) => {
                Value::Map(fields.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Seq(items)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_objects_become_maps() {
        let value = Value::from(json!({ "a": 1, "b": [true, "x"], "c": 1.5 }));
        let fields = value.fields().unwrap();
        assert_eq!(fields["a"].as_int(), Some(1));
        assert_eq!(fields["c"].as_float(), Some(1.5));
        match &fields["b"] {
            Value::Seq(items) => {
                assert_eq!(items[0].as_bool(), Some(true));
                assert_eq!(items[1].as_str(), Some("x"));
            }
            other => panic!("expected a sequence, got {:?}", other),
        }
    }

    #[test]
    fn records_serialize_as_objects() {
        let value = Value::record("Point", [("x", Value::from(1)), ("y", Value::from(2))]);
        assert!(value.is_object());
        assert_eq!(value.to_json(), json!({ "x": 1, "y": 2 }));
    }

    #[test]
    fn nan_becomes_json_null() {
        assert_eq!(Value::Float(f64::NAN).to_json(), serde_json::Value::Null);
    }

    #[test]
    fn ints_widen_to_floats() {
        assert_eq!(Value::from(3).as_float(), Some(3.0));
        assert_eq!(Value::from(3.5).as_int(), None);
        assert!(Value::from(None::<i64>).is_null());
    }
}
