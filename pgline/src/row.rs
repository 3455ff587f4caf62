//! Postgres row assembly.
//!
//! - [`Row`]
//! - [`Value`]
//! - [`DecodeError`]
//!
//! Rows are decoded from the text format of simple query. The column `type_id`
//! from [`FieldDescriptor`] selects the coercion:
//!
//! | type id          | value          |
//! |------------------|----------------|
//! | `16` bool        | [`Value::Bool`]|
//! | `20`,`21`,`23`   | [`Value::Int`] |
//! | anything else    | [`Value::Text`]|
//!
//! A `NULL` column is [`Value::Null`] regardless of type.
use bytes::Bytes;
use std::{borrow::Cow, fmt, num::ParseIntError, str::Utf8Error};

use crate::{
    common::ByteStr,
    ext::FmtExt,
    postgres::oid,
};

pub use crate::postgres::backend::FieldDescriptor;

/// A coerced column value.
#[derive(Clone, PartialEq, Eq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    /// Raw text, unconverted.
    Text(ByteStr),
}

impl Value {
    fn decode(field: &FieldDescriptor, value: Option<Bytes>) -> Result<Value, DecodeError> {
        let Some(value) = value else {
            return Ok(Value::Null);
        };
        match field.type_id {
            oid::BOOL => match &value[..] {
                b"t" => Ok(Value::Bool(true)),
                b"f" => Ok(Value::Bool(false)),
                _ => Err(DecodeError::Bool(value)),
            },
            oid::INT8 | oid::INT2 | oid::INT4 => {
                Ok(Value::Int(std::str::from_utf8(&value)?.parse()?))
            }
            _ => Ok(Value::Text(ByteStr::from_utf8(value)?)),
        }
    }

    /// Return `true` if value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the text of [`Value::Text`].
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(b) => fmt::Debug::fmt(b, f),
            Value::Int(i) => fmt::Debug::fmt(i, f),
            Value::Text(s) => fmt::Debug::fmt(s, f),
        }
    }
}

/// Postgres row, a record keyed by field name.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Row {
    columns: Vec<(ByteStr, Value)>,
}

impl Row {
    /// Build a row from `DataRow` values with the metadata of the preceding `RowDescription`.
    pub fn assemble(fields: &[FieldDescriptor], values: Vec<Option<Bytes>>) -> Result<Row, DecodeError> {
        if fields.len() != values.len() {
            return Err(DecodeError::ColumnCount { expect: fields.len(), found: values.len() });
        }

        let columns = fields
            .iter()
            .zip(values)
            .map(|(field, value)| Ok((field.name.clone(), Value::decode(field, value)?)))
            .collect::<Result<_, DecodeError>>()?;

        Ok(Row { columns })
    }

    /// Returns `true` if row contains no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Returns the number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Get column value by name.
    ///
    /// When multiple columns share a name, the last one wins.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns.iter().rev().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Same as [`Row::get`] but returns [`DecodeError::ColumnNotFound`] if missing.
    pub fn try_get(&self, name: &str) -> Result<&Value, DecodeError> {
        self.get(name).ok_or_else(|| DecodeError::ColumnNotFound(String::from(name).into()))
    }

    /// Iterate over column name and value, in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Serialize into [`serde_json::Value`] object.
    #[cfg(feature = "json")]
    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

impl IntoIterator for Row {
    type Item = (ByteStr, Value);

    type IntoIter = std::vec::IntoIter<(ByteStr, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.columns.into_iter()
    }
}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Text(s) => serializer.serialize_str(s),
        }
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Row {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (name, value) in self.iter() {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for DecodeError {
            fn from($pat: $ty) -> Self {
                $body
            }
        }
    };
}

/// An error when decoding row value.
#[derive(Clone)]
pub enum DecodeError {
    /// Postgres return non utf8 string.
    Utf8(Utf8Error),
    /// Integer column is not a valid integer.
    Int(ParseIntError),
    /// Bool column is neither `t` nor `f`.
    Bool(Bytes),
    /// `DataRow` column count differs from `RowDescription`.
    ColumnCount { expect: usize, found: usize },
    /// Column requested not found.
    ColumnNotFound(Cow<'static, str>),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("failed to decode value, ")?;
        match self {
            Self::Utf8(e) => write!(f, "{e}"),
            Self::Int(e) => write!(f, "invalid integer: {e}"),
            Self::Bool(b) => write!(f, "invalid bool: {:?}", b.lossy()),
            Self::ColumnCount { expect, found } => {
                write!(f, "expected {expect} columns, found {found}")
            }
            Self::ColumnNotFound(name) => write!(f, "column not found: {name:?}"),
        }
    }
}

from!(<Utf8Error>e => Self::Utf8(e));
from!(<ParseIntError>e => Self::Int(e));

impl std::error::Error for DecodeError { }

impl fmt::Debug for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::postgres::Oid;

    fn field(name: &'static str, type_id: Oid) -> FieldDescriptor {
        FieldDescriptor {
            name: ByteStr::from_static(name),
            table_id: 0,
            column_id: 0,
            type_id,
            type_size: -1,
            type_modifier: -1,
            format_code: 0,
        }
    }

    fn value(s: &'static str) -> Option<Bytes> {
        Some(Bytes::from_static(s.as_bytes()))
    }

    #[test]
    fn coerce_by_type_id() {
        let fields = [field("ok", 16), field("no", 16), field("n", 23), field("big", 20), field("s", 21), field("t", 25)];
        let row = Row::assemble(
            &fields,
            vec![value("t"), value("f"), value("42"), value("-9007199254740993"), value("-7"), value("42")],
        )
        .unwrap();

        assert_eq!(row.get("ok"), Some(&Value::Bool(true)));
        assert_eq!(row.get("no"), Some(&Value::Bool(false)));
        assert_eq!(row.get("n"), Some(&Value::Int(42)));
        assert_eq!(row.get("big").and_then(Value::as_i64), Some(-9_007_199_254_740_993));
        assert_eq!(row.get("s").and_then(Value::as_i64), Some(-7));
        assert_eq!(row.get("t").and_then(Value::as_str), Some("42"));
        assert_eq!(row.len(), 6);
    }

    #[test]
    fn null_at_any_type() {
        let fields = [field("b", 16), field("i", 23), field("t", 25)];
        let row = Row::assemble(&fields, vec![None, None, None]).unwrap();
        assert!(row.iter().all(|(_, v)| v.is_null()));
    }

    #[test]
    fn column_order_and_last_name_wins() {
        let fields = [field("a", 23), field("b", 25), field("a", 23)];
        let row = Row::assemble(&fields, vec![value("1"), value("x"), value("3")]).unwrap();
        let names = row.iter().map(|(n, _)| n).collect::<Vec<_>>();
        assert_eq!(names, ["a", "b", "a"]);
        assert_eq!(row.get("a"), Some(&Value::Int(3)));
        assert!(row.try_get("c").is_err());
    }

    #[test]
    fn invalid_values() {
        let err = Row::assemble(&[field("i", 23)], vec![value("4x")]).unwrap_err();
        assert!(matches!(err, DecodeError::Int(_)));
        let err = Row::assemble(&[field("b", 16)], vec![value("true")]).unwrap_err();
        assert!(matches!(err, DecodeError::Bool(_)));
        let err = Row::assemble(&[field("b", 16)], vec![]).unwrap_err();
        assert!(matches!(err, DecodeError::ColumnCount { expect: 1, found: 0 }));
    }

    #[cfg(feature = "json")]
    #[test]
    fn json_object() {
        let fields = [field("id", 23), field("name", 25), field("admin", 16), field("bio", 25)];
        let row = Row::assemble(&fields, vec![value("1"), value("Ada"), value("t"), None]).unwrap();
        assert_eq!(
            row.to_json().unwrap(),
            serde_json::json!({ "id": 1, "name": "Ada", "admin": true, "bio": null })
        );
    }
}
