//! Typed cell values and the column types they are converted into.
use std::{
    fmt,
    hash::{Hash, Hasher},
};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::error::StorageError;

/// Normalised column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ColumnType {
    Integer,
    Float,
    String,
    Bool,
    Date,
    DateTime,
    Key,
    /// Raw bytes taken verbatim from the text representation.
    Blob,
    /// Bytes transported base64 encoded.
    Blob64,
}

impl ColumnType {
    /// Maps a declared type onto a [`ColumnType`].
    ///
    /// Matching is case-insensitive and ignores a parenthesised suffix, so
    /// `VARCHAR(20)`-like declarations resolve the same as their bare name.
    pub fn from_alias(declared: &str) -> Option<Self> {
        let name = declared.split('(').next().unwrap_or_default().trim();
        let t = match name.to_lowercase().as_str() {
            "integer" | "int" | "int32" | "int64" | "bigint" | "smallint" | "unsigned integer"
            | "unsigned bigint" => ColumnType::Integer,
            "float" | "real" | "double" | "double precision" | "decimal" => ColumnType::Float,
            "text" | "string" | "varargs" => ColumnType::String,
            "date" => ColumnType::Date,
            "datetime" | "timestamp" => ColumnType::DateTime,
            "key" => ColumnType::Key,
            "bool" | "boolean" => ColumnType::Bool,
            "blob" => ColumnType::Blob,
            "blob64" => ColumnType::Blob64,
            _ => return None,
        };
        Some(t)
    }

    /// Converts the text representation of a cell into a typed [`Value`].
    pub fn cast(&self, raw: &str) -> Result<Value, ConversionFailure> {
        let trimmed = raw.trim();
        let value = match self {
            ColumnType::String | ColumnType::Key => Value::Str(raw.to_string()),
            ColumnType::Integer => Value::Integer(trimmed.parse().map_err(|_| ConversionFailure)?),
            ColumnType::Float => Value::Float(trimmed.parse().map_err(|_| ConversionFailure)?),
            ColumnType::Bool => Value::Bool(trimmed.to_lowercase().starts_with('t')),
            ColumnType::Date => Value::Date(parse_date(trimmed).ok_or(ConversionFailure)?),
            ColumnType::DateTime => {
                Value::DateTime(parse_datetime(trimmed).ok_or(ConversionFailure)?)
            }
            ColumnType::Blob => Value::Blob(raw.as_bytes().to_vec()),
            ColumnType::Blob64 => Value::Blob(STANDARD.decode(trimmed).map_err(|_| ConversionFailure)?),
        };
        Ok(value)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::String => "string",
            ColumnType::Bool => "bool",
            ColumnType::Date => "date",
            ColumnType::DateTime => "dateTime",
            ColumnType::Key => "key",
            ColumnType::Blob => "blob",
            ColumnType::Blob64 => "blob64",
        };
        write!(f, "{name}")
    }
}

/// Marker returned by [`ColumnType::cast`]; the schema attaches the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionFailure;

impl ConversionFailure {
    pub(crate) fn into_error(self, column: &str, value: &str, t: ColumnType) -> StorageError {
        StorageError::Conversion {
            column: column.to_string(),
            value: value.to_string(),
            column_type: t,
        }
    }
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_datetime(s).map(|dt| dt.date_naive()))
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    // Seconds since the epoch, as sent by OML clients.
    let secs: f64 = s.parse().ok()?;
    if !secs.is_finite() {
        return None;
    }
    let whole = secs.floor();
    let nanos = ((secs - whole) * 1e9).round().min(999_999_999.0) as u32;
    DateTime::from_timestamp(whole as i64, nanos)
}

/// A single typed cell of a row.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
    Blob(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

// Floats compare by bit pattern so values can key hash maps.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::DateTime(a), Value::DateTime(b)) => a == b,
            (Value::Blob(a), Value::Blob(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Integer(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Str(s) => s.hash(state),
            Value::Bool(b) => b.hash(state),
            Value::Date(d) => d.hash(state),
            Value::DateTime(dt) => dt.hash(state),
            Value::Blob(b) => b.hash(state),
        }
    }
}

/// Text form accepted back by [`ColumnType::cast`]; blobs are base64 encoded.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::DateTime(dt) => write!(f, "{}", dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            Value::Blob(b) => write!(f, "{}", STANDARD.encode(b)),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn roundtrip(t: ColumnType, value: Value) {
        let text = value.to_string();
        assert_eq!(t.cast(&text).unwrap(), value, "'{text}' as {t}");
    }

    #[test]
    fn alias_table() {
        assert_eq!(ColumnType::from_alias("BIGINT"), Some(ColumnType::Integer));
        assert_eq!(ColumnType::from_alias("int32"), Some(ColumnType::Integer));
        assert_eq!(ColumnType::from_alias("Double Precision"), Some(ColumnType::Float));
        assert_eq!(ColumnType::from_alias("real"), Some(ColumnType::Float));
        assert_eq!(ColumnType::from_alias("varargs(10)"), Some(ColumnType::String));
        assert_eq!(ColumnType::from_alias("dateTime"), Some(ColumnType::DateTime));
        assert_eq!(ColumnType::from_alias("blob64"), Some(ColumnType::Blob64));
        assert_eq!(ColumnType::from_alias("geometry"), None);
    }

    #[test]
    fn cast_roundtrips_supported_types() {
        roundtrip(ColumnType::Integer, Value::Integer(-42));
        roundtrip(ColumnType::Float, Value::Float(21.3));
        roundtrip(ColumnType::Float, Value::Float(1e-7));
        roundtrip(ColumnType::Bool, Value::Bool(true));
        roundtrip(ColumnType::Bool, Value::Bool(false));
        roundtrip(ColumnType::String, Value::Str("hello world".into()));
        roundtrip(
            ColumnType::Date,
            Value::Date(NaiveDate::from_ymd_opt(2013, 7, 4).unwrap()),
        );
        roundtrip(
            ColumnType::DateTime,
            Value::DateTime(Utc.with_ymd_and_hms(2015, 3, 1, 12, 30, 5).unwrap()),
        );
        roundtrip(ColumnType::Blob64, Value::Blob(vec![0, 159, 146, 150, 255]));
    }

    #[test]
    fn cast_bool_is_prefix_based() {
        assert_eq!(ColumnType::Bool.cast("True").unwrap(), Value::Bool(true));
        assert_eq!(ColumnType::Bool.cast("t").unwrap(), Value::Bool(true));
        assert_eq!(ColumnType::Bool.cast("no").unwrap(), Value::Bool(false));
    }

    #[test]
    fn cast_datetime_from_epoch_seconds() {
        let v = ColumnType::DateTime.cast("1.5").unwrap();
        assert_eq!(
            v,
            Value::DateTime(DateTime::from_timestamp(1, 500_000_000).unwrap())
        );
    }

    #[test]
    fn cast_rejects_garbage() {
        assert!(ColumnType::Integer.cast("twelve").is_err());
        assert!(ColumnType::Float.cast("").is_err());
        assert!(ColumnType::Blob64.cast("@@@").is_err());
        assert!(ColumnType::Date.cast("yesterday").is_err());
    }

    #[test]
    fn floats_hash_and_compare_by_bits() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(Value::Float(12.5));
        assert!(set.contains(&Value::Float(12.5)));
        assert_ne!(Value::Float(1.0), Value::Integer(1));
    }
}
