//! Column types and value coercion.
//!
//! Used in two places: declared source schemas coerce raw JSON fields at
//! read time (failures are rescued), and validation casts derive typed
//! columns (failures become `NULL`).

use serde::{Deserialize, Serialize};

use crate::value::{Value, parse_date, parse_timestamp};

/// Supported column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    String,
    Int64,
    /// Double precision. Decimal columns such as `amount` are cast here.
    #[serde(alias = "double", alias = "decimal")]
    Float64,
    Boolean,
    Date,
    Timestamp,
    /// Raw JSON, kept as-is.
    Json,
}

impl FieldType {
    /// Cast a value to this type.
    ///
    /// `NULL` casts to `NULL` for every type. Returns `None` if the value
    /// cannot be represented in the target type.
    pub fn cast(&self, value: &Value) -> Option<Value> {
        if value.is_null() {
            return Some(Value::Null);
        }
        match self {
            FieldType::String => Some(match value {
                Value::String(s) => Value::String(s.clone()),
                other => match other.to_json() {
                    serde_json::Value::String(s) => Value::String(s),
                    json => Value::String(json.to_string()),
                },
            }),
            FieldType::Int64 => match value {
                Value::Int64(i) => Some(Value::Int64(*i)),
                Value::Float64(f) if f.fract() == 0.0 && f.is_finite() => {
                    let i = *f as i64;
                    (i as f64 == *f).then_some(Value::Int64(i))
                }
                Value::Boolean(b) => Some(Value::Int64(i64::from(*b))),
                Value::String(s) => s.trim().parse::<i64>().ok().map(Value::Int64),
                _ => None,
            },
            FieldType::Float64 => match value {
                Value::Int64(i) => Some(Value::Float64(*i as f64)),
                Value::Float64(f) => Some(Value::Float64(*f)),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(Value::Float64),
                _ => None,
            },
            FieldType::Boolean => match value {
                Value::Boolean(b) => Some(Value::Boolean(*b)),
                Value::Int64(0) => Some(Value::Boolean(false)),
                Value::Int64(1) => Some(Value::Boolean(true)),
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "t" | "yes" | "1" => Some(Value::Boolean(true)),
                    "false" | "f" | "no" | "0" => Some(Value::Boolean(false)),
                    _ => None,
                },
                _ => None,
            },
            FieldType::Date => match value {
                Value::Date(d) => Some(Value::Date(*d)),
                Value::Timestamp(ts) => Some(Value::Date(ts.date_naive())),
                Value::String(s) => parse_date(s).map(Value::Date),
                _ => None,
            },
            FieldType::Timestamp => match value {
                Value::Timestamp(ts) => Some(Value::Timestamp(*ts)),
                Value::Date(d) => d.and_hms_opt(0, 0, 0).map(|dt| Value::Timestamp(dt.and_utc())),
                Value::String(s) => parse_timestamp(s).map(Value::Timestamp),
                _ => None,
            },
            FieldType::Json => Some(match value {
                Value::Json(v) => Value::Json(v.clone()),
                other => Value::Json(other.to_json()),
            }),
        }
    }
}
