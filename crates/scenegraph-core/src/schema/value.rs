//! Attribute values held by instances.

use super::types::ValueKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Value {
    String(String),
    Long(i64),
    Double(f64),
    Boolean(bool),
    Datetime(String),
    Date(String),
}

/// A value could not be converted to the requested kind.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("cannot convert {value} ({from}) to {to}")]
pub struct ConversionError {
    /// Rendered source value.
    pub value: String,
    /// Source kind.
    pub from: ValueKind,
    /// Requested kind.
    pub to: ValueKind,
}

impl Value {
    /// The kind of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::String(_) => ValueKind::String,
            Value::Long(_) => ValueKind::Long,
            Value::Double(_) => ValueKind::Double,
            Value::Boolean(_) => ValueKind::Boolean,
            Value::Datetime(_) => ValueKind::Datetime,
            Value::Date(_) => ValueKind::Date,
        }
    }

    /// Convenience constructor for string values.
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    /// The string payload, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Convert this value to `target`.
    pub fn convert_to(&self, target: ValueKind) -> Result<Value, ConversionError> {
        let fail = || ConversionError {
            value: self.to_string(),
            from: self.kind(),
            to: target,
        };
        if self.kind() == target {
            return Ok(self.clone());
        }
        let converted = match (self, target) {
            (v, ValueKind::String) => Value::String(v.to_string()),
            (Value::Long(n), ValueKind::Double) => Value::Double(*n as f64),
            (Value::Double(d), ValueKind::Long) => {
                if d.fract() != 0.0 || !d.is_finite() {
                    return Err(fail());
                }
                Value::Long(*d as i64)
            }
            (Value::Long(n), ValueKind::Boolean) => match n {
                0 => Value::Boolean(false),
                1 => Value::Boolean(true),
                _ => return Err(fail()),
            },
            (Value::Boolean(b), ValueKind::Long) => Value::Long(i64::from(*b)),
            (Value::Date(d), ValueKind::Datetime) => Value::Datetime(format!("{d}T00:00:00")),
            (Value::Datetime(dt), ValueKind::Date) => {
                let date = dt.split('T').next().unwrap_or(dt);
                if !looks_like_date(date) {
                    return Err(fail());
                }
                Value::Date(date.to_string())
            }
            (Value::String(s), kind) => Self::parse_as(s, kind).ok_or_else(fail)?,
            _ => return Err(fail()),
        };
        Ok(converted)
    }

    /// Parse text as a value of `kind`.
    pub fn parse_as(text: &str, kind: ValueKind) -> Option<Value> {
        let text = text.trim();
        match kind {
            ValueKind::String => Some(Value::String(text.to_string())),
            ValueKind::Long => text.parse().ok().map(Value::Long),
            ValueKind::Double => text.parse().ok().map(Value::Double),
            ValueKind::Boolean => match text.to_ascii_lowercase().as_str() {
                "true" => Some(Value::Boolean(true)),
                "false" => Some(Value::Boolean(false)),
                _ => None,
            },
            ValueKind::Datetime => {
                let date = text.split('T').next().unwrap_or(text);
                looks_like_date(date).then(|| Value::Datetime(text.to_string()))
            }
            ValueKind::Date => looks_like_date(text).then(|| Value::Date(text.to_string())),
        }
    }

    /// Coerce a loosely typed JSON value into a value of `kind`.
    pub fn from_json(json: &serde_json::Value, kind: ValueKind) -> Option<Value> {
        match json {
            serde_json::Value::String(s) => Self::parse_as(s, kind),
            serde_json::Value::Bool(b) => Value::Boolean(*b).convert_to(kind).ok(),
            serde_json::Value::Number(n) => {
                let value = match n.as_i64() {
                    Some(i) => Value::Long(i),
                    None => Value::Double(n.as_f64()?),
                };
                value.convert_to(kind).ok()
            }
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => f.write_str(s),
            Value::Long(n) => write!(f, "{n}"),
            Value::Double(d) => write!(f, "{d}"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Datetime(s) | Value::Date(s) => f.write_str(s),
        }
    }
}

fn looks_like_date(text: &str) -> bool {
    let parts: Vec<&str> = text.split('-').collect();
    parts.len() == 3
        && parts[0].len() == 4
        && parts[1].len() == 2
        && parts[2].len() == 2
        && parts.iter().all(|p| p.chars().all(|c| c.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_conversions() {
        assert_eq!(Value::Long(3).convert_to(ValueKind::Double), Ok(Value::Double(3.0)));
        assert_eq!(Value::Double(4.0).convert_to(ValueKind::Long), Ok(Value::Long(4)));
        assert!(Value::Double(4.5).convert_to(ValueKind::Long).is_err());
    }

    #[test]
    fn test_string_parsing() {
        assert_eq!(
            Value::string("12").convert_to(ValueKind::Long),
            Ok(Value::Long(12))
        );
        let err = Value::string("large").convert_to(ValueKind::Double).unwrap_err();
        assert_eq!(err.from, ValueKind::String);
        assert_eq!(err.to, ValueKind::Double);
        assert_eq!(
            Value::string("2024-05-01").convert_to(ValueKind::Date),
            Ok(Value::Date("2024-05-01".into()))
        );
    }

    #[test]
    fn test_everything_renders_to_string() {
        assert_eq!(
            Value::Boolean(true).convert_to(ValueKind::String),
            Ok(Value::string("true"))
        );
        assert_eq!(
            Value::Double(1.5).convert_to(ValueKind::String),
            Ok(Value::string("1.5"))
        );
    }

    #[test]
    fn test_from_json() {
        let json = serde_json::json!(7);
        assert_eq!(Value::from_json(&json, ValueKind::Double), Some(Value::Double(7.0)));
        let json = serde_json::json!("red");
        assert_eq!(Value::from_json(&json, ValueKind::String), Some(Value::string("red")));
        assert_eq!(Value::from_json(&serde_json::json!(null), ValueKind::String), None);
    }
}
