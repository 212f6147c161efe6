//! Values and records fed into the builder.
//!
//! [`Value`] is the scalar model for everything that ends up as a SQL
//! literal. [`Record`] is an ordered column → value list used for INSERT and
//! UPDATE input; its key order is the column order of the rendered statement.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone};
use serde_json::Value as JsonValue;

/// A scalar SQL value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    /// Rendered as its JSON text.
    Json(JsonValue),
}

impl Value {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this value for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::UInt(_) => "uint",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Date(_) => "date",
            Self::DateTime(_) => "datetime",
            Self::Json(_) => "json",
        }
    }
}

macro_rules! impl_from_int {
    ($variant:ident, $target:ty; $($t:ty),+) => {
        $(
            impl From<$t> for Value {
                fn from(v: $t) -> Self {
                    Value::$variant(v as $target)
                }
            }
        )+
    };
}

impl_from_int!(Int, i64; i8, i16, i32, i64, isize);
impl_from_int!(UInt, u64; u8, u16, u32, u64, usize);

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v as f64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&String> for Value {
    fn from(v: &String) -> Self {
        Value::String(v.clone())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::Date(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::DateTime(v)
    }
}

/// Zoned timestamps are stored as the wall-clock time of their own zone.
impl<Tz: TimeZone> From<DateTime<Tz>> for Value {
    fn from(v: DateTime<Tz>) -> Self {
        Value::DateTime(v.naive_local())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// JSON scalars map onto their SQL counterparts; arrays and objects are kept
/// as JSON documents.
impl From<JsonValue> for Value {
    fn from(v: JsonValue) -> Self {
        match v {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Value::UInt(u)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            JsonValue::String(s) => Value::String(s),
            other => Value::Json(other),
        }
    }
}

impl From<&JsonValue> for Value {
    fn from(v: &JsonValue) -> Self {
        v.clone().into()
    }
}

/// An ordered list of column values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    entries: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a column, replacing an earlier value for the same column in place.
    pub fn set(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(column, value);
        self
    }

    /// In-place variant of [`Record::set`].
    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        let column = column.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(c, _)| *c == column) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((column, value)),
        }
    }

    /// A missing column reads as `None`, a present NULL as `Some(&Value::Null)`.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(c, _)| c.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(c, v)| (c.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = Record::new();
        for (k, v) in iter {
            record.insert(k, v);
        }
        record
    }
}

impl From<serde_json::Map<String, JsonValue>> for Record {
    fn from(map: serde_json::Map<String, JsonValue>) -> Self {
        map.into_iter().collect()
    }
}

/// Rows handed to the insert terminals: one record or a batch.
pub trait IntoRecords {
    fn into_records(self) -> Vec<Record>;
}

impl IntoRecords for Record {
    fn into_records(self) -> Vec<Record> {
        vec![self]
    }
}

impl IntoRecords for &Record {
    fn into_records(self) -> Vec<Record> {
        vec![self.clone()]
    }
}

impl IntoRecords for Vec<Record> {
    fn into_records(self) -> Vec<Record> {
        self
    }
}

impl IntoRecords for &[Record] {
    fn into_records(self) -> Vec<Record> {
        self.to_vec()
    }
}

impl<const N: usize> IntoRecords for [Record; N] {
    fn into_records(self) -> Vec<Record> {
        self.into()
    }
}

impl IntoRecords for serde_json::Map<String, JsonValue> {
    fn into_records(self) -> Vec<Record> {
        vec![self.into()]
    }
}

/// A JSON object is one row, a JSON array of objects is a batch. Anything
/// else yields no rows.
impl IntoRecords for JsonValue {
    fn into_records(self) -> Vec<Record> {
        match self {
            JsonValue::Object(map) => vec![map.into()],
            JsonValue::Array(items) => items
                .into_iter()
                .filter_map(|item| match item {
                    JsonValue::Object(map) => Some(Record::from(map)),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_primitives() {
        assert_eq!(Value::from(3i32), Value::Int(3));
        assert_eq!(Value::from(3u8), Value::UInt(3));
        assert_eq!(Value::from(true), Value::Bool(true));
        assert_eq!(Value::from("x"), Value::String("x".to_string()));
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some(2.5)), Value::Float(2.5));
    }

    #[test]
    fn test_from_json() {
        assert_eq!(Value::from(json!(null)), Value::Null);
        assert_eq!(Value::from(json!(-4)), Value::Int(-4));
        assert_eq!(Value::from(json!(u64::MAX)), Value::UInt(u64::MAX));
        assert_eq!(Value::from(json!(1.5)), Value::Float(1.5));
        assert_eq!(Value::from(json!("a")), Value::String("a".into()));
        assert_eq!(Value::from(json!([1, 2])).type_name(), "json");
    }

    #[test]
    fn test_record_keeps_insertion_order() {
        let record = Record::new().set("b", 1).set("a", 2).set("b", 3);
        let columns: Vec<_> = record.columns().collect();
        assert_eq!(columns, vec!["b", "a"]);
        assert_eq!(record.get("b"), Some(&Value::Int(3)));
    }

    #[test]
    fn test_record_missing_vs_null() {
        let record = Record::new().set("a", Value::Null);
        assert_eq!(record.get("a"), Some(&Value::Null));
        assert_eq!(record.get("b"), None);
    }

    #[test]
    fn test_record_from_json_map_keeps_order() {
        let value = json!({"zeta": 1, "alpha": null, "mid": "x"});
        let records = value.into_records();
        assert_eq!(records.len(), 1);
        let columns: Vec<_> = records[0].columns().collect();
        assert_eq!(columns, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_json_array_into_records_skips_non_objects() {
        let records = json!([{"a": 1}, 5, {"a": 2}]).into_records();
        assert_eq!(records.len(), 2);
        assert!(json!("scalar").into_records().is_empty());
    }
}
