// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The Value tree: the payload type for every command argument, command
//! result and event crossing the host boundary.
//!
//! `Value` is a closed sum type. Accessors are strict: asking a `String` for
//! an integer fails with [`BridgeError::TypeMismatch`]. The single exception is
//! [`Value::as_int_compat`], which accepts a string holding a valid decimal
//! integer because some hosts transmit numeric handles (texture ids, data
//! channel ids) as strings.
//!
//! Maps preserve insertion order so that events serialize deterministically.

use std::fmt;

use base64::Engine as _;
use bytes::Bytes;
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{BridgeError, Result};

/// Ordered string-keyed map of values.
pub type ValueMap = IndexMap<String, Value>;

/// A numeric value. Integers and floats are kept apart so integer handles
/// survive a round trip through the tree unchanged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Int(i64),
    Float(f64),
}

/// The variant tag of a [`Value`], used in type-mismatch errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    Float,
    String,
    Bytes,
    List,
    Map,
}

impl ValueKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::Bytes => "bytes",
            Self::List => "list",
            Self::Map => "map",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dynamically-typed tree used for all command and event payloads.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Bytes(Bytes),
    List(Vec<Value>),
    Map(ValueMap),
}

impl Value {
    /// Creates an empty map value.
    pub fn map() -> Self {
        Self::Map(ValueMap::new())
    }

    pub const fn kind(&self) -> ValueKind {
        match self {
            Self::Null => ValueKind::Null,
            Self::Bool(_) => ValueKind::Bool,
            Self::Number(Number::Int(_)) => ValueKind::Int,
            Self::Number(Number::Float(_)) => ValueKind::Float,
            Self::String(_) => ValueKind::String,
            Self::Bytes(_) => ValueKind::Bytes,
            Self::List(_) => ValueKind::List,
            Self::Map(_) => ValueKind::Map,
        }
    }

    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    fn mismatch(&self, expected: ValueKind) -> BridgeError {
        BridgeError::TypeMismatch { expected, found: self.kind() }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Self::Bool(b) => Ok(*b),
            other => Err(other.mismatch(ValueKind::Bool)),
        }
    }

    /// Reads an integer. Floats are rejected rather than truncated.
    pub fn as_int(&self) -> Result<i64> {
        match self {
            Self::Number(Number::Int(i)) => Ok(*i),
            other => Err(other.mismatch(ValueKind::Int)),
        }
    }

    /// Reads an integer, also accepting a string that holds a decimal integer.
    ///
    /// Only numeric handle fields go through this path; everything else uses
    /// [`Value::as_int`].
    pub fn as_int_compat(&self) -> Result<i64> {
        match self {
            Self::Number(Number::Int(i)) => Ok(*i),
            Self::String(s) => s.parse::<i64>().map_err(|_| self.mismatch(ValueKind::Int)),
            other => Err(other.mismatch(ValueKind::Int)),
        }
    }

    /// Reads a float. Integers widen.
    #[allow(clippy::cast_precision_loss)]
    pub fn as_float(&self) -> Result<f64> {
        match self {
            Self::Number(Number::Float(f)) => Ok(*f),
            Self::Number(Number::Int(i)) => Ok(*i as f64),
            other => Err(other.mismatch(ValueKind::Float)),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Self::String(s) => Ok(s),
            other => Err(other.mismatch(ValueKind::String)),
        }
    }

    pub fn as_bytes(&self) -> Result<&Bytes> {
        match self {
            Self::Bytes(b) => Ok(b),
            other => Err(other.mismatch(ValueKind::Bytes)),
        }
    }

    pub fn as_list(&self) -> Result<&[Self]> {
        match self {
            Self::List(items) => Ok(items),
            other => Err(other.mismatch(ValueKind::List)),
        }
    }

    pub fn as_map(&self) -> Result<&ValueMap> {
        match self {
            Self::Map(map) => Ok(map),
            other => Err(other.mismatch(ValueKind::Map)),
        }
    }

    pub fn into_map(self) -> Result<ValueMap> {
        match self {
            Self::Map(map) => Ok(map),
            other => Err(other.mismatch(ValueKind::Map)),
        }
    }

    /// Looks up `key` if this is a map. Returns `None` for non-maps and for
    /// missing keys alike.
    pub fn get(&self, key: &str) -> Option<&Self> {
        match self {
            Self::Map(map) => map.get(key),
            _ => None,
        }
    }

    /// Inserts `key` into a map value. A non-map value is replaced with a
    /// single-entry map.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Self>) {
        if let Self::Map(map) = self {
            map.insert(key.into(), value.into());
        } else {
            let mut map = ValueMap::new();
            map.insert(key.into(), value.into());
            *self = Self::Map(map);
        }
    }

    /// Looks up `field`, treating an explicit `null` as absent.
    pub fn opt(&self, field: &str) -> Option<&Self> {
        self.get(field).filter(|v| !v.is_null())
    }

    /// Looks up a field that must be present and non-null.
    pub fn require(&self, field: &str) -> Result<&Self> {
        self.opt(field).ok_or_else(|| {
            BridgeError::invalid_argument(format!("missing required field '{field}'"))
        })
    }

    pub fn require_str(&self, field: &str) -> Result<&str> {
        self.require(field)?.as_str().map_err(|e| e.for_field(field))
    }

    pub fn require_int(&self, field: &str) -> Result<i64> {
        self.require(field)?.as_int().map_err(|e| e.for_field(field))
    }

    /// Like [`Value::require_int`] but accepts decimal strings.
    pub fn require_int_compat(&self, field: &str) -> Result<i64> {
        self.require(field)?.as_int_compat().map_err(|e| e.for_field(field))
    }

    pub fn require_bool(&self, field: &str) -> Result<bool> {
        self.require(field)?.as_bool().map_err(|e| e.for_field(field))
    }

    pub fn require_bytes(&self, field: &str) -> Result<&Bytes> {
        self.require(field)?.as_bytes().map_err(|e| e.for_field(field))
    }

    pub fn opt_str(&self, field: &str) -> Result<Option<&str>> {
        self.opt(field).map(|v| v.as_str().map_err(|e| e.for_field(field))).transpose()
    }

    pub fn opt_bool(&self, field: &str) -> Result<Option<bool>> {
        self.opt(field).map(|v| v.as_bool().map_err(|e| e.for_field(field))).transpose()
    }

    pub fn opt_int(&self, field: &str) -> Result<Option<i64>> {
        self.opt(field).map(|v| v.as_int().map_err(|e| e.for_field(field))).transpose()
    }

    pub fn opt_float(&self, field: &str) -> Result<Option<f64>> {
        self.opt(field).map(|v| v.as_float().map_err(|e| e.for_field(field))).transpose()
    }

    pub fn opt_map(&self, field: &str) -> Result<Option<&ValueMap>> {
        self.opt(field).map(|v| v.as_map().map_err(|e| e.for_field(field))).transpose()
    }

    /// Reads an optional list of strings. A missing field is an empty list.
    pub fn opt_str_list(&self, field: &str) -> Result<Vec<String>> {
        let Some(items) = self.opt(field) else {
            return Ok(Vec::new());
        };
        items
            .as_list()
            .and_then(|items| {
                items.iter().map(|item| item.as_str().map(str::to_string)).collect()
            })
            .map_err(|e| e.for_field(field))
    }

    /// Converts to JSON. Bytes become base64 strings and non-finite floats
    /// become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Number(Number::Int(i)) => serde_json::Value::from(*i),
            Self::Number(Number::Float(f)) => serde_json::Number::from_f64(*f)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Bytes(b) => {
                serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(b))
            },
            Self::List(items) => {
                serde_json::Value::Array(items.iter().map(Self::to_json).collect())
            },
            Self::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => n.as_i64().map_or_else(
                || Self::Number(Number::Float(n.as_f64().unwrap_or(f64::NAN))),
                |i| Self::Number(Number::Int(i)),
            ),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Self::from).collect())
            },
            serde_json::Value::Object(obj) => {
                Self::Map(obj.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            },
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Self::from)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Number(Number::Int(i))
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Number(Number::Int(i64::from(i)))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Self::Number(Number::Int(i64::from(i)))
    }
}

impl From<u16> for Value {
    fn from(i: u16) -> Self {
        Self::Number(Number::Int(i64::from(i)))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Number(Number::Float(f))
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

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Self::Bytes(b)
    }
}

impl From<Vec<Self>> for Value {
    fn from(items: Vec<Self>) -> Self {
        Self::List(items)
    }
}

impl From<ValueMap> for Value {
    fn from(map: ValueMap) -> Self {
        Self::Map(map)
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Self::Null, Into::into)
    }
}

impl<T: Into<Self>> FromIterator<T> for Value {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::List(iter.into_iter().map(Into::into).collect())
    }
}

/// Builds a [`Value::Map`] from `key => value` pairs.
///
/// ```
/// use rtcbridge_core::vmap;
/// let v = vmap! { "event" => "onRenegotiationNeeded" };
/// assert_eq!(v.get("event").unwrap().as_str().unwrap(), "onRenegotiationNeeded");
/// ```
#[macro_export]
macro_rules! vmap {
    () => { $crate::value::Value::map() };
    ($($key:expr => $val:expr),+ $(,)?) => {{
        let mut map = $crate::value::ValueMap::new();
        $( map.insert(::std::string::String::from($key), $crate::value::Value::from($val)); )+
        $crate::value::Value::Map(map)
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn field_accessors_name_the_field() {
        let args = crate::vmap! { "label" => "chat", "id" => "7", "ordered" => Value::Null };

        assert_eq!(args.require_str("label").unwrap(), "chat");
        assert_eq!(args.require_int_compat("id").unwrap(), 7);
        assert_eq!(args.opt_bool("ordered").unwrap(), None);

        let missing = args.require_str("protocol").unwrap_err();
        assert_eq!(missing.kind(), crate::ErrorKind::InvalidArgument);
        assert!(missing.message().contains("protocol"));

        let wrong = args.require_int("id").unwrap_err();
        assert_eq!(wrong.message(), "field 'id' must be int, got string");
    }

    #[test]
    fn strict_accessors_report_mismatch() {
        let v = Value::from("42");
        let err = v.as_int().unwrap_err();
        assert_eq!(
            err,
            BridgeError::TypeMismatch { expected: ValueKind::Int, found: ValueKind::String }
        );
        assert!(Value::from(1.5).as_int().is_err());
        assert!(Value::Null.as_bool().is_err());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn compat_int_accepts_decimal_strings_only() {
        assert_eq!(Value::from("42").as_int_compat().unwrap(), 42);
        assert_eq!(Value::from("-7").as_int_compat().unwrap(), -7);
        assert!(Value::from(" -7 ").as_int_compat().is_err());
        assert_eq!(Value::from(9_i64).as_int_compat().unwrap(), 9);
        assert!(Value::from("4.2").as_int_compat().is_err());
        assert!(Value::from("0x10").as_int_compat().is_err());
        assert!(Value::from(true).as_int_compat().is_err());
    }

    #[test]
    #[allow(clippy::unwrap_used, clippy::float_cmp)]
    fn ints_widen_to_float() {
        assert_eq!(Value::from(3_i64).as_float().unwrap(), 3.0);
    }

    #[test]
    fn json_conversion_encodes_bytes_as_base64() {
        let v = vmap! {
            "type" => "binary",
            "data" => Bytes::from_static(b"hi"),
            "nan" => f64::NAN,
        };
        let json = v.to_json();
        assert_eq!(json["data"], serde_json::json!("aGk="));
        assert!(json["nan"].is_null());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn json_ints_stay_ints() {
        let v = Value::from(serde_json::json!({ "textureId": 7, "volume": 0.5, "list": [1, "a"] }));
        assert_eq!(v.get("textureId").unwrap().kind(), ValueKind::Int);
        assert_eq!(v.get("volume").unwrap().kind(), ValueKind::Float);
        assert_eq!(v.get("list").unwrap().as_list().unwrap().len(), 2);
    }

    #[test]
    fn map_preserves_insertion_order() {
        let v = vmap! { "z" => 1_i64, "a" => 2_i64, "m" => 3_i64 };
        assert_eq!(v.to_string(), r#"{"z":1,"a":2,"m":3}"#);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn insert_promotes_non_map() {
        let mut v = Value::Null;
        v.insert("id", 5_i64);
        assert_eq!(v.get("id").unwrap().as_int().unwrap(), 5);
    }
}
