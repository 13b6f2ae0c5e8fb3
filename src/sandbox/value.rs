//! Values that cross the host/guest boundary.
//!
//! Everything the host sends into the sandbox and everything it reads back
//! (variables, tool arguments, tool results, the final expression) is a
//! [`Value`]. The serde form is the tagged transfer format understood by the
//! guest driver: `{"type": "int", "value": 3}`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A guest-representable value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// Python `None`.
    None,
    /// Python `bool`.
    Bool(bool),
    /// Python `int` within the signed 64-bit range.
    Int(i64),
    /// Python `float`; always finite.
    Float(f64),
    /// Python `str`.
    Str(String),
    /// Python `list`.
    List(Vec<Value>),
    /// Python `tuple`.
    Tuple(Vec<Value>),
    /// Python `dict`, in insertion order.
    Dict(Vec<(Value, Value)>),
}

/// Why a value cannot be represented inside the guest.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValueError {
    /// NaN and infinities have no transfer form.
    #[error("non-finite float {0}")]
    NonFiniteFloat(f64),

    /// Dictionary keys must be hashable on the Python side.
    #[error("unhashable dict key of type {0}")]
    UnhashableKey(&'static str),

    /// A JSON number outside the signed 64-bit range.
    #[error("number {0} is out of range")]
    NumberOutOfRange(String),
}

impl Value {
    /// The Python type name of this value.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
        }
    }

    /// Check that the value can be rebuilt inside the guest.
    pub fn validate(&self) -> std::result::Result<(), ValueError> {
        match self {
            Value::Float(f) if !f.is_finite() => Err(ValueError::NonFiniteFloat(*f)),
            Value::List(items) | Value::Tuple(items) => items.iter().try_for_each(Value::validate),
            Value::Dict(entries) => entries.iter().try_for_each(|(key, value)| {
                if !key.is_hashable() {
                    return Err(ValueError::UnhashableKey(key.type_name()));
                }
                key.validate()?;
                value.validate()
            }),
            _ => Ok(()),
        }
    }

    fn is_hashable(&self) -> bool {
        match self {
            Value::List(_) | Value::Dict(_) => false,
            Value::Tuple(items) => items.iter().all(Value::is_hashable),
            _ => true,
        }
    }

    /// Borrow the string content, if this is a `Str`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Get the integer content, if this is an `Int`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Get a numeric view of `Int` and `Float` values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Get the boolean content, if this is a `Bool`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Look up a string key in a `Dict`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Dict(entries) => entries
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }

    /// Convert into plain JSON. Tuples become arrays and non-string dict keys
    /// are rendered with their Python representation.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Value::None => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Str(s) => Json::String(s.clone()),
            Value::List(items) | Value::Tuple(items) => {
                Json::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Dict(entries) => Json::Object(
                entries
                    .iter()
                    .map(|(k, v)| {
                        let key = match k {
                            Value::Str(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (key, v.to_json())
                    })
                    .collect(),
            ),
        }
    }
}

impl TryFrom<serde_json::Value> for Value {
    type Error = ValueError;

    fn try_from(json: serde_json::Value) -> std::result::Result<Self, Self::Error> {
        use serde_json::Value as Json;
        Ok(match json {
            Json::Null => Value::None,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if n.is_u64() {
                    return Err(ValueError::NumberOutOfRange(n.to_string()));
                } else {
                    let f = n
                        .as_f64()
                        .ok_or_else(|| ValueError::NumberOutOfRange(n.to_string()))?;
                    Value::Float(f)
                }
            }
            Json::String(s) => Value::Str(s),
            Json::Array(items) => Value::List(
                items
                    .into_iter()
                    .map(Value::try_from)
                    .collect::<std::result::Result<_, _>>()?,
            ),
            Json::Object(map) => Value::Dict(
                map.into_iter()
                    .map(|(k, v)| Ok((Value::Str(k), Value::try_from(v)?)))
                    .collect::<std::result::Result<_, ValueError>>()?,
            ),
        })
    }
}

/// Renders the value the way Python's `repr()` would.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => f.write_str("None"),
            Value::Bool(true) => f.write_str("True"),
            Value::Bool(false) => f.write_str("False"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => {
                if x.fract() == 0.0 && x.abs() < 1e16 {
                    write!(f, "{x:.1}")
                } else {
                    write!(f, "{x}")
                }
            }
            Value::Str(s) => write_py_str(f, s),
            Value::List(items) => {
                f.write_str("[")?;
                write_items(f, items)?;
                f.write_str("]")
            }
            Value::Tuple(items) => {
                f.write_str("(")?;
                write_items(f, items)?;
                if items.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
            Value::Dict(entries) => {
                f.write_str("{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
        }
    }
}

fn write_items(f: &mut fmt::Formatter<'_>, items: &[Value]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

fn write_py_str(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    let quote = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    write!(f, "{quote}")?;
    for c in s.chars() {
        match c {
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\r' => f.write_str("\\r")?,
            '\t' => f.write_str("\\t")?,
            c if c == quote => write!(f, "\\{c}")?,
            c if c.is_control() => write!(f, "\\x{:02x}", c as u32)?,
            c => write!(f, "{c}")?,
        }
    }
    write!(f, "{quote}")
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
        Value::Int(i.into())
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i.into())
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

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Value::None)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl<V: Into<Value>> From<BTreeMap<String, V>> for Value {
    fn from(map: BTreeMap<String, V>) -> Self {
        Value::Dict(map.into_iter().map(|(k, v)| (Value::Str(k), v.into())).collect())
    }
}

impl<V: Into<Value>> From<HashMap<String, V>> for Value {
    fn from(map: HashMap<String, V>) -> Self {
        let mut entries: Vec<_> = map.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Value::Dict(entries.into_iter().map(|(k, v)| (Value::Str(k), v.into())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transfer_format() {
        let value = Value::Dict(vec![(Value::from("k"), Value::Tuple(vec![1.into(), Value::None]))]);
        let encoded = serde_json::to_value(&value).unwrap();
        assert_eq!(
            encoded,
            json!({"type": "dict", "value": [[
                {"type": "str", "value": "k"},
                {"type": "tuple", "value": [{"type": "int", "value": 1}, {"type": "none"}]}
            ]]})
        );
        let decoded: Value = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_python_repr() {
        let nested = Value::Dict(vec![
            (Value::from("list"), Value::from(vec![1, 2])),
            (Value::from("flag"), Value::Bool(true)),
            (Value::from("ratio"), Value::Float(2.0)),
        ]);
        assert_eq!(nested.to_string(), "{'list': [1, 2], 'flag': True, 'ratio': 2.0}");
        assert_eq!(Value::Tuple(vec![Value::Int(1)]).to_string(), "(1,)");
        assert_eq!(Value::from("it's").to_string(), "\"it's\"");
        assert_eq!(Value::from("a\nb").to_string(), "'a\\nb'");
    }

    #[test]
    fn test_validate_rejects_nan_and_unhashable_keys() {
        assert_eq!(
            Value::List(vec![Value::Float(f64::NAN)]).validate().map_err(|e| e.to_string()),
            Err("non-finite float NaN".to_string())
        );
        let bad = Value::Dict(vec![(Value::List(vec![]), Value::None)]);
        assert_eq!(bad.validate(), Err(ValueError::UnhashableKey("list")));
        let ok = Value::Dict(vec![(Value::Tuple(vec![1.into(), "a".into()]), Value::None)]);
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_from_json() {
        let value = Value::try_from(json!({"x": [1, 2.5, "s", null, true]})).unwrap();
        assert_eq!(
            value.get("x"),
            Some(&Value::List(vec![
                Value::Int(1),
                Value::Float(2.5),
                Value::from("s"),
                Value::None,
                Value::Bool(true),
            ]))
        );
        assert!(matches!(
            Value::try_from(json!(u64::MAX)),
            Err(ValueError::NumberOutOfRange(_))
        ));
    }

    #[test]
    fn test_to_json() {
        let value = Value::Dict(vec![
            (Value::Int(1), Value::Tuple(vec![Value::from("a")])),
            (Value::from("b"), Value::Float(0.5)),
        ]);
        assert_eq!(value.to_json(), json!({"1": ["a"], "b": 0.5}));
    }
}
