use crate::{Error, Result};
use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use std::net::IpAddr;
use std::str::FromStr;

/// A raw cell as produced by the stream transport: a CQL-like type tag plus
/// the wire representation of the value. Tags are matched case-insensitively.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TypedCell {
    #[serde(rename = "type")]
    pub tag: String,
    pub value: serde_json::Value,
}

impl TypedCell {
    pub fn new(tag: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            tag: tag.into(),
            value,
        }
    }
}

/// A decoded, native cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Text(String),
    Inet(IpAddr),
    Date(NaiveDate),
    Int(i32),
    BigInt(i64),
    Float(f32),
    Double(f64),
    Decimal(BigDecimal),
    Boolean(bool),
    /// Instant as epoch milliseconds.
    Timestamp(i64),
    Blob(Vec<u8>),
}

impl CellValue {
    /// Decode a raw transport cell into its native value.
    /// Unknown tags and representation mismatches fail with `UnsupportedType`.
    pub fn decode(cell: &TypedCell) -> Result<Self> {
        let tag = cell.tag.to_ascii_lowercase();
        let value = &cell.value;

        let mismatch = || {
            Error::UnsupportedType(format!(
                "cell tag '{}' does not accept representation {}",
                cell.tag, value
            ))
        };

        match tag.as_str() {
            "text" | "ascii" | "varchar" => value
                .as_str()
                .map(|s| Self::Text(s.to_string()))
                .ok_or_else(mismatch),
            "inet" => value
                .as_str()
                .and_then(|s| IpAddr::from_str(s).ok())
                .map(Self::Inet)
                .ok_or_else(mismatch),
            "date" => value
                .as_str()
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
                .map(Self::Date)
                .ok_or_else(mismatch),
            "int" | "smallint" | "tinyint" => value
                .as_i64()
                .and_then(|n| i32::try_from(n).ok())
                .map(Self::Int)
                .ok_or_else(mismatch),
            "bigint" | "counter" => value.as_i64().map(Self::BigInt).ok_or_else(mismatch),
            "float" => value
                .as_f64()
                .map(|f| Self::Float(f as f32))
                .ok_or_else(mismatch),
            "double" => value.as_f64().map(Self::Double).ok_or_else(mismatch),
            "decimal" => match value {
                serde_json::Value::String(s) => BigDecimal::from_str(s).ok(),
                serde_json::Value::Number(n) => BigDecimal::from_str(&n.to_string()).ok(),
                _ => None,
            }
            .map(Self::Decimal)
            .ok_or_else(mismatch),
            "boolean" => value.as_bool().map(Self::Boolean).ok_or_else(mismatch),
            "timestamp" => match value {
                serde_json::Value::Number(n) => n.as_i64(),
                serde_json::Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|ts| ts.timestamp_millis()),
                _ => None,
            }
            .map(Self::Timestamp)
            .ok_or_else(mismatch),
            "blob" => value
                .as_str()
                .and_then(|s| base64::decode(s).ok())
                .map(Self::Blob)
                .ok_or_else(mismatch),
            other => Err(Error::UnsupportedType(format!("unknown cell tag '{other}'"))),
        }
    }

    /// Encode back into the canonical wire representation. Inverse of
    /// `decode` for every supported value; used by fixtures and tests.
    pub fn encode(&self) -> TypedCell {
        use serde_json::{json, Value};

        let (tag, value) = match self {
            Self::Text(s) => ("text", Value::String(s.clone())),
            Self::Inet(ip) => ("inet", Value::String(ip.to_string())),
            Self::Date(d) => ("date", Value::String(d.format("%Y-%m-%d").to_string())),
            Self::Int(n) => ("int", json!(n)),
            Self::BigInt(n) => ("bigint", json!(n)),
            Self::Float(f) => ("float", json!(f)),
            Self::Double(f) => ("double", json!(f)),
            Self::Decimal(d) => ("decimal", Value::String(d.to_string())),
            Self::Boolean(b) => ("boolean", json!(b)),
            Self::Timestamp(ms) => ("timestamp", json!(ms)),
            Self::Blob(bytes) => ("blob", Value::String(base64::encode(bytes))),
        };
        TypedCell::new(tag, value)
    }

    /// Project into plain JSON for sink bodies and the filter context:
    /// numbers stay numbers, timestamps are epoch milliseconds, dates and
    /// decimals become strings, blobs become base64 strings.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::{json, Value};

        match self {
            Self::Text(s) => Value::String(s.clone()),
            Self::Inet(ip) => Value::String(ip.to_string()),
            Self::Date(d) => Value::String(d.format("%Y-%m-%d").to_string()),
            Self::Int(n) => json!(n),
            Self::BigInt(n) => json!(n),
            Self::Float(f) => json!(f),
            Self::Double(f) => json!(f),
            Self::Decimal(d) => Value::String(d.to_string()),
            Self::Boolean(b) => json!(b),
            Self::Timestamp(ms) => json!(ms),
            Self::Blob(bytes) => Value::String(base64::encode(bytes)),
        }
    }

    /// A short name for the value's type, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Inet(_) => "inet",
            Self::Date(_) => "date",
            Self::Int(_) => "int",
            Self::BigInt(_) => "bigint",
            Self::Float(_) => "float",
            Self::Double(_) => "double",
            Self::Decimal(_) => "decimal",
            Self::Boolean(_) => "boolean",
            Self::Timestamp(_) => "timestamp",
            Self::Blob(_) => "blob",
        }
    }
}
