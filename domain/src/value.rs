//! Scalar values exchanged between the query model and stores.
//!
//! Storage classes follow SQLite: null, 64-bit integer, double and text.

use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::schema::FieldKind;
use crate::CoreError;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Storage kind, `None` for null.
    pub fn kind(&self) -> Option<FieldKind> {
        match self {
            Value::Null => None,
            Value::Int(_) => Some(FieldKind::Integer),
            Value::Real(_) => Some(FieldKind::Real),
            Value::Text(_) => Some(FieldKind::Text),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Real(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Text rendering used by concatenation and casts; `None` for null.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Int(v) => Some(v.to_string()),
            Value::Real(v) => Some(format!("{v:?}")),
            Value::Text(s) => Some(s.clone()),
        }
    }

    /// Comparison with SQL null semantics: `None` when either side is null.
    pub fn sql_cmp(&self, other: &Value) -> Option<Ordering> {
        if self.is_null() || other.is_null() {
            return None;
        }
        Some(self.sort_cmp(other))
    }

    /// Total order used for sorting and grouping:
    /// null < numbers < text, numbers compared by magnitude.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        fn rank(v: &Value) -> u8 {
            match v {
                Value::Null => 0,
                Value::Int(_) | Value::Real(_) => 1,
                Value::Text(_) => 2,
            }
        }
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (a, b) if rank(a) == 1 && rank(b) == 1 => {
                let (x, y) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
                x.total_cmp(&y)
            }
            (a, b) => rank(a).cmp(&rank(b)),
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Real(v) => write!(f, "{v:?}"),
            Value::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Typed extraction from a [`Value`].
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self, CoreError>;
}

fn mismatch(expected: &str, got: &Value) -> CoreError {
    CoreError::Mapping(format!("expected {expected}, got {got}"))
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self, CoreError> {
        Ok(value.clone())
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Result<Self, CoreError> {
        value.as_i64().ok_or_else(|| mismatch("integer", value))
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> Result<Self, CoreError> {
        let wide = i64::from_value(value)?;
        i32::try_from(wide).map_err(|_| mismatch("32-bit integer", value))
    }
}

impl FromValue for u64 {
    fn from_value(value: &Value) -> Result<Self, CoreError> {
        let wide = i64::from_value(value)?;
        u64::try_from(wide).map_err(|_| mismatch("non-negative integer", value))
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self, CoreError> {
        value.as_f64().ok_or_else(|| mismatch("number", value))
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self, CoreError> {
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| mismatch("text", value))
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self, CoreError> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_never_compares() {
        assert_eq!(Value::Null.sql_cmp(&Value::Int(1)), None);
        assert_eq!(Value::Int(1).sql_cmp(&Value::Null), None);
    }

    #[test]
    fn numbers_compare_across_storage_classes() {
        assert_eq!(Value::Int(2).sql_cmp(&Value::Real(2.5)), Some(Ordering::Less));
        assert_eq!(Value::Real(3.0).sort_cmp(&Value::Int(3)), Ordering::Equal);
    }

    #[test]
    fn sort_order_puts_null_first_then_numbers_then_text() {
        let mut vals = vec![Value::from("a"), Value::Int(5), Value::Null];
        vals.sort_by(Value::sort_cmp);
        assert_eq!(vals, vec![Value::Null, Value::Int(5), Value::from("a")]);
    }

    #[test]
    fn real_text_keeps_fraction_marker() {
        assert_eq!(Value::Real(15.0).to_text().as_deref(), Some("15.0"));
        assert_eq!(Value::Int(10).to_text().as_deref(), Some("10"));
    }

    #[test]
    fn typed_extraction() {
        assert_eq!(i32::from_value(&Value::Int(40)).unwrap(), 40);
        assert!(i32::from_value(&Value::Int(i64::MAX)).is_err());
        assert_eq!(Option::<String>::from_value(&Value::Null).unwrap(), None);
        assert!(String::from_value(&Value::Int(1)).is_err());
    }

    #[test]
    fn display_quotes_text() {
        assert_eq!(Value::from("it's").to_string(), "'it''s'");
        assert_eq!(Value::Null.to_string(), "null");
    }
}
