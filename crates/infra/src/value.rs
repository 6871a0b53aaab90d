//! Scalar values used in filters, patches and claim statements.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use tenantgate_core::TenantId;

/// A typed scalar bound into a statement.
///
/// The Postgres backend binds each variant natively (`Null` is emitted as a
/// literal so the column type drives inference); the in-memory backend
/// compares against JSON rows semantically.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
    Json(JsonValue),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// JSON rendering, matching what serde produces for the same Rust type.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Int(i) => JsonValue::from(*i),
            Value::Float(f) => JsonValue::from(*f),
            Value::Text(s) => JsonValue::String(s.clone()),
            Value::Uuid(u) => JsonValue::String(u.to_string()),
            Value::Timestamp(t) => JsonValue::String(t.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            Value::Json(v) => v.clone(),
        }
    }

    /// Best-effort conversion from a JSON scalar (strings stay text).
    pub fn from_json(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map(Value::Float).unwrap_or(Value::Json(JsonValue::Number(n))),
            },
            JsonValue::String(s) => Value::Text(s),
            other => Value::Json(other),
        }
    }

    /// Ordering of a stored JSON cell relative to this value (`cell.cmp(self)`).
    ///
    /// Follows SQL semantics: anything compared with NULL is unknown (`None`).
    pub(crate) fn compare_json(&self, cell: &JsonValue) -> Option<Ordering> {
        if cell.is_null() {
            return None;
        }
        match self {
            Value::Null => None,
            Value::Bool(b) => cell.as_bool().map(|c| c.cmp(b)),
            Value::Int(i) => match cell.as_i64() {
                Some(c) => Some(c.cmp(i)),
                None => cell.as_f64().and_then(|c| c.partial_cmp(&(*i as f64))),
            },
            Value::Float(f) => cell.as_f64().and_then(|c| c.partial_cmp(f)),
            Value::Text(s) => match cell {
                JsonValue::String(c) => Some(c.as_str().cmp(s.as_str())),
                _ => None,
            },
            Value::Uuid(u) => cell
                .as_str()
                .and_then(|c| Uuid::parse_str(c).ok())
                .map(|c| c.cmp(u)),
            Value::Timestamp(t) => cell.as_str().and_then(parse_timestamp).map(|c| c.cmp(t)),
            Value::Json(v) => (v == cell).then_some(Ordering::Equal),
        }
    }
}

pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Ordering of two stored JSON cells, NULLs last (Postgres `ASC` default).
pub(crate) fn compare_cells(a: &JsonValue, b: &JsonValue) -> Ordering {
    match (a, b) {
        (JsonValue::Null, JsonValue::Null) => Ordering::Equal,
        (JsonValue::Null, _) => Ordering::Greater,
        (_, JsonValue::Null) => Ordering::Less,
        (JsonValue::String(x), JsonValue::String(y)) => match (parse_timestamp(x), parse_timestamp(y)) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x.cmp(y),
        },
        (JsonValue::Number(x), JsonValue::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x
                .as_f64()
                .partial_cmp(&y.as_f64())
                .unwrap_or(Ordering::Equal),
        },
        (JsonValue::Bool(x), JsonValue::Bool(y)) => x.cmp(y),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Text(s) => f.write_str(s),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

macro_rules! impl_from {
    ($t:ty => $variant:ident) => {
        impl From<$t> for Value {
            fn from(value: $t) -> Self {
                Value::$variant(value.into())
            }
        }
    };
}

impl_from!(bool => Bool);
impl_from!(i64 => Int);
impl_from!(i32 => Int);
impl_from!(u32 => Int);
impl_from!(f64 => Float);
impl_from!(String => Text);
impl_from!(Uuid => Uuid);
impl_from!(DateTime<Utc> => Timestamp);

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<TenantId> for Value {
    fn from(value: TenantId) -> Self {
        Value::Uuid(*value.as_uuid())
    }
}

impl From<JsonValue> for Value {
    fn from(value: JsonValue) -> Self {
        Value::from_json(value)
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn timestamps_compare_by_instant_not_by_text() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        // Fractional seconds sort before "Z" as text; must still be later.
        let later = json!("2024-05-01T12:00:00.500Z");
        let offset_equal = json!("2024-05-01T14:00:00+02:00");

        assert_eq!(Value::from(t).compare_json(&later), Some(Ordering::Greater));
        assert_eq!(Value::from(t).compare_json(&offset_equal), Some(Ordering::Equal));
        assert_eq!(compare_cells(&later, &json!("2024-05-01T12:00:00Z")), Ordering::Greater);
    }

    #[test]
    fn null_never_compares() {
        assert_eq!(Value::Int(1).compare_json(&JsonValue::Null), None);
        assert_eq!(Value::Null.compare_json(&json!(1)), None);
    }

    #[test]
    fn uuid_and_text_cells() {
        let id = Uuid::now_v7();
        assert_eq!(
            Value::from(id).compare_json(&json!(id.to_string())),
            Some(Ordering::Equal)
        );
        assert_eq!(Value::from("PENDING").compare_json(&json!("PENDING")), Some(Ordering::Equal));
        assert_eq!(Value::from("PENDING").compare_json(&json!(3)), None);
    }

    #[test]
    fn json_scalars_map_back_to_typed_values() {
        assert_eq!(Value::from(json!(42)), Value::Int(42));
        assert_eq!(Value::from(json!("abc")), Value::Text("abc".into()));
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(json!({"a": 1})), Value::Json(json!({"a": 1})));
    }

    #[test]
    fn nulls_sort_last() {
        let mut cells = vec![json!(null), json!(3), json!(1)];
        cells.sort_by(compare_cells);
        assert_eq!(cells, vec![json!(1), json!(3), json!(null)]);
    }
}
