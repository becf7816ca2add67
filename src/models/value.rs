//! Property values and their declared types.
//!
//! State snapshots hold a map of property keys to [`PropertyValue`]s. The
//! ontology declares one [`PropertyType`] per key, and validation is an exact
//! tag comparison between the two: there is no coercion between numeric types
//! and no subtyping.
//!
//! | Type | Declared as | Rust payload |
//! |------|-------------|--------------|
//! | `String` | `str`, `string` | `String` |
//! | `Int` | `int` | `i64` |
//! | `Float` | `float` | `f64` |
//! | `Bool` | `bool` | `bool` |
//! | `Date` | `date` | `NaiveDate` |
//! | `Time` | `time` | `NaiveTime` |
//! | `DateTime` | `datetime` | `NaiveDateTime` |
//! | `StringList` | `list`, `list[str]` | `Vec<String>` |

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Property key to value map of one state.
///
/// Ordered so that rendered queries and stored JSON are deterministic.
pub type PropertyMap = BTreeMap<String, PropertyValue>;

/// Key of the soft-delete flag every kind inherits from the root kind.
pub const DELETED_KEY: &str = "_deleted";

/// Closed union of the value types a property can hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    /// UTF-8 text.
    String(String),
    /// Signed 64-bit integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// Boolean.
    Bool(bool),
    /// Calendar date.
    Date(NaiveDate),
    /// Wall-clock time.
    Time(NaiveTime),
    /// Date and time without zone.
    DateTime(NaiveDateTime),
    /// List of strings.
    StringList(Vec<String>),
}

impl PropertyValue {
    /// Returns the type tag of this value.
    #[must_use]
    pub const fn property_type(&self) -> PropertyType {
        match self {
            Self::String(_) => PropertyType::String,
            Self::Int(_) => PropertyType::Int,
            Self::Float(_) => PropertyType::Float,
            Self::Bool(_) => PropertyType::Bool,
            Self::Date(_) => PropertyType::Date,
            Self::Time(_) => PropertyType::Time,
            Self::DateTime(_) => PropertyType::DateTime,
            Self::StringList(_) => PropertyType::StringList,
        }
    }

    /// Returns the string payload, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the boolean payload, if this is a boolean.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the integer payload, if this is an integer.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Converts a JSON scalar into a property value.
    ///
    /// Whole numbers become `Int`, other numbers `Float`. Arrays of strings
    /// become `StringList`. Objects, nulls and mixed arrays are rejected.
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) => Some(Self::String(s.clone())),
            serde_json::Value::Bool(b) => Some(Self::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float)),
            serde_json::Value::Array(items) => items
                .iter()
                .map(|item| item.as_str().map(ToString::to_string))
                .collect::<Option<Vec<_>>>()
                .map(Self::StringList),
            serde_json::Value::Null | serde_json::Value::Object(_) => None,
        }
    }

    /// Renders the value as a plain JSON value, dropping the type tag.
    ///
    /// Temporal values become ISO-8601 strings. This is the shape query
    /// parameters are sent in.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Value::from(*f),
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Date(d) => serde_json::Value::String(d.format("%Y-%m-%d").to_string()),
            Self::Time(t) => serde_json::Value::String(t.format("%H:%M:%S%.f").to_string()),
            Self::DateTime(dt) => {
                serde_json::Value::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
            },
            Self::StringList(items) => serde_json::Value::from(items.clone()),
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Date(d) => write!(f, "{d}"),
            Self::Time(t) => write!(f, "{t}"),
            Self::DateTime(dt) => write!(f, "{dt}"),
            Self::StringList(items) => write!(f, "[{}]", items.join(", ")),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<NaiveDate> for PropertyValue {
    fn from(value: NaiveDate) -> Self {
        Self::Date(value)
    }
}

impl From<NaiveTime> for PropertyValue {
    fn from(value: NaiveTime) -> Self {
        Self::Time(value)
    }
}

impl From<NaiveDateTime> for PropertyValue {
    fn from(value: NaiveDateTime) -> Self {
        Self::DateTime(value)
    }
}

impl From<Vec<String>> for PropertyValue {
    fn from(value: Vec<String>) -> Self {
        Self::StringList(value)
    }
}

/// Declared type of an ontology property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    /// Text.
    String,
    /// Integer.
    Int,
    /// Float.
    Float,
    /// Boolean.
    Bool,
    /// Calendar date.
    Date,
    /// Wall-clock time.
    Time,
    /// Date and time.
    DateTime,
    /// List of strings.
    StringList,
}

impl PropertyType {
    /// Returns the canonical declaration name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::String => "str",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Date => "date",
            Self::Time => "time",
            Self::DateTime => "datetime",
            Self::StringList => "list[str]",
        }
    }

    /// Parses a declaration name, case-insensitively.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "str" | "string" | "text" => Some(Self::String),
            "int" | "integer" => Some(Self::Int),
            "float" | "double" => Some(Self::Float),
            "bool" | "boolean" => Some(Self::Bool),
            "date" => Some(Self::Date),
            "time" => Some(Self::Time),
            "datetime" | "date_time" => Some(Self::DateTime),
            "list" | "list[str]" | "string_list" => Some(Self::StringList),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PropertyType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
            .ok_or_else(|| crate::Error::InvalidInput(format!("unknown property type: {s}")))
    }
}

/// Builds a property map from parallel key and value lists.
///
/// # Errors
///
/// Returns [`crate::ValidationError::LengthMismatch`] when the lists differ in length.
pub fn zip_properties<K, V>(keys: &[K], values: Vec<V>) -> crate::Result<PropertyMap>
where
    K: AsRef<str>,
    V: Into<PropertyValue>,
{
    if keys.len() != values.len() {
        return Err(crate::ValidationError::LengthMismatch {
            keys: keys.len(),
            values: values.len(),
        }
        .into());
    }
    Ok(keys
        .iter()
        .map(|k| k.as_ref().to_string())
        .zip(values.into_iter().map(Into::into))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("str", PropertyType::String)]
    #[test_case("String", PropertyType::String)]
    #[test_case("int", PropertyType::Int)]
    #[test_case("float", PropertyType::Float)]
    #[test_case("bool", PropertyType::Bool)]
    #[test_case("date", PropertyType::Date)]
    #[test_case("time", PropertyType::Time)]
    #[test_case("datetime", PropertyType::DateTime)]
    #[test_case("list", PropertyType::StringList)]
    fn test_property_type_parse(name: &str, expected: PropertyType) {
        assert_eq!(PropertyType::parse(name), Some(expected));
    }

    #[test]
    fn test_property_type_parse_unknown() {
        assert!(PropertyType::parse("decimal").is_none());
        assert!("decimal".parse::<PropertyType>().is_err());
    }

    #[test]
    fn test_no_numeric_coercion() {
        assert_eq!(PropertyValue::from(1).property_type(), PropertyType::Int);
        assert_eq!(PropertyValue::from(1.0).property_type(), PropertyType::Float);
        assert_ne!(PropertyValue::from(1), PropertyValue::from(1.0));
    }

    #[test]
    fn test_from_json() {
        assert_eq!(
            PropertyValue::from_json(&serde_json::json!(42)),
            Some(PropertyValue::Int(42))
        );
        assert_eq!(
            PropertyValue::from_json(&serde_json::json!(4.5)),
            Some(PropertyValue::Float(4.5))
        );
        assert_eq!(
            PropertyValue::from_json(&serde_json::json!(["a", "b"])),
            Some(PropertyValue::StringList(vec!["a".into(), "b".into()]))
        );
        assert!(PropertyValue::from_json(&serde_json::json!(null)).is_none());
        assert!(PropertyValue::from_json(&serde_json::json!([1, "b"])).is_none());
    }

    #[test]
    fn test_serde_keeps_type_tag() {
        let date = NaiveDate::from_ymd_opt(1950, 3, 1).unwrap();
        let value = PropertyValue::Date(date);
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, r#"{"type":"date","value":"1950-03-01"}"#);
        let back: PropertyValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_zip_properties_length_mismatch() {
        let err = zip_properties(&["a", "b"], vec![1]).unwrap_err();
        assert!(err.is_validation());
        let map = zip_properties(&["a"], vec!["x"]).unwrap();
        assert_eq!(map.get("a"), Some(&PropertyValue::from("x")));
    }
}
