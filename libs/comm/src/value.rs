//! Dynamic values exchanged through communicators

use serde::{Deserialize, Serialize};

/// Application value carried by a message
///
/// Codecs turn a `Value` into bytes and back. `List` is the sequence type the
/// composite patterns split and assemble. `Map` keeps insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(Vec<(String, Value)>),
}

impl Value {
    /// The value handed out when a receive finds nothing
    pub fn empty() -> Self {
        Value::Null
    }

    /// True for `Null` and for zero-length strings, bytes, lists and maps
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Str(s) => s.is_empty(),
            Value::Bytes(b) => b.is_empty(),
            Value::List(l) => l.is_empty(),
            Value::Map(m) => m.is_empty(),
            Value::Bool(_) | Value::Int(_) | Value::Float(_) => false,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn into_list(self) -> Option<Vec<Value>> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// Look up a key in a `Map`
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(m) => m.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Join parts end to end
    ///
    /// Lists are concatenated, strings and bytes appended. Mixed kinds
    /// produce a list of the parts.
    pub fn concat(parts: Vec<Value>) -> Value {
        if parts.iter().all(|p| matches!(p, Value::Str(_))) {
            let joined = parts
                .into_iter()
                .filter_map(|p| match p {
                    Value::Str(s) => Some(s),
                    _ => None,
                })
                .collect::<String>();
            return Value::Str(joined);
        }
        if parts.iter().all(|p| matches!(p, Value::Bytes(_))) {
            let mut out = Vec::new();
            for p in parts {
                if let Value::Bytes(b) = p {
                    out.extend(b);
                }
            }
            return Value::Bytes(out);
        }
        if parts.iter().all(|p| matches!(p, Value::List(_))) {
            let items = parts.into_iter().filter_map(Value::into_list).flatten();
            return Value::List(items.collect());
        }
        Value::List(parts)
    }

    /// Short kind name used in error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(a) => Value::List(a.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(o) => {
                Value::Map(o.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&Value> for serde_json::Value {
    /// Bytes become an array of numbers; non-finite floats become null
    fn from(v: &Value) -> Self {
        match v {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::Array(b.iter().map(|x| (*x).into()).collect()),
            Value::List(l) => serde_json::Value::Array(l.iter().map(Into::into).collect()),
            Value::Map(m) => serde_json::Value::Object(
                m.iter().map(|(k, v)| (k.clone(), v.into())).collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concat_joins_like_kinds() {
        assert_eq!(
            Value::concat(vec!["ab".into(), "cd".into()]),
            Value::Str("abcd".into())
        );
        assert_eq!(
            Value::concat(vec![vec![1u8].into(), vec![2u8, 3].into()]),
            Value::Bytes(vec![1, 2, 3])
        );
        assert_eq!(
            Value::concat(vec![
                Value::List(vec![1.into()]),
                Value::List(vec![2.into(), 3.into()])
            ]),
            Value::List(vec![1.into(), 2.into(), 3.into()])
        );
    }

    #[test]
    fn concat_mixed_kinds_keeps_parts() {
        let parts = vec![Value::Int(1), Value::Str("x".into())];
        assert_eq!(Value::concat(parts.clone()), Value::List(parts));
    }

    #[test]
    fn json_conversion_preserves_structure() {
        let v = Value::Map(vec![
            ("a".into(), Value::Int(1)),
            ("b".into(), Value::List(vec![Value::Float(0.5), Value::Null])),
        ]);
        let json: serde_json::Value = (&v).into();
        assert_eq!(Value::from(json), v);
    }

    #[test]
    fn empty_values() {
        assert!(Value::empty().is_empty());
        assert!(Value::Str(String::new()).is_empty());
        assert!(!Value::Int(0).is_empty());
    }
}
