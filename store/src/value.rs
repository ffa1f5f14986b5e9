//! SQL values, rows, metrics and identifier validation.

use std::fmt;
use std::str::FromStr;

use rusqlite::ToSql;
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use sift_embeddings::{cosine_similarity, dot_product, euclidean_distance};

use crate::error::{Result, StoreError};

/// A result row: column name → JSON value.
pub type Row = serde_json::Map<String, JsonValue>;

/// Longest identifier accepted, matching the PostgreSQL limit.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Check that `value` is a bare SQL identifier (`^[A-Za-z_][A-Za-z0-9_]*$`,
/// at most 63 characters). `what` names the identifier in the error.
pub fn validate_identifier(value: &str, what: &str) -> Result<()> {
    let mut chars = value.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid_start && valid_rest && value.len() <= MAX_IDENTIFIER_LEN {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier {
            what: what.to_string(),
            value: value.to_string(),
        })
    }
}

/// Check a column type declaration such as `TEXT PRIMARY KEY` or
/// `VARCHAR(64)`. Quotes, semicolons and comment markers are rejected.
pub fn validate_column_type(value: &str) -> Result<()> {
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '(' | ')' | ',');
    let trimmed = value.trim();
    if trimmed.is_empty() || !trimmed.chars().all(allowed) {
        return Err(StoreError::InvalidIdentifier {
            what: "column type".to_string(),
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Distance metric for vector search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Metric {
    /// `1 - cosine similarity`.
    #[default]
    #[serde(rename = "cosine")]
    Cosine,
    /// Negative inner product.
    #[serde(rename = "ip")]
    InnerProduct,
    /// Euclidean distance.
    #[serde(rename = "l2")]
    L2,
}

impl Metric {
    /// Name used in SQL and configuration.
    pub fn as_str(self) -> &'static str {
        match self {
            Metric::Cosine => "cosine",
            Metric::InnerProduct => "ip",
            Metric::L2 => "l2",
        }
    }

    /// Distance between two vectors; smaller is closer for every metric.
    pub fn distance(self, a: &[f32], b: &[f32]) -> Result<f32> {
        Ok(match self {
            Metric::Cosine => 1.0 - cosine_similarity(a, b)?,
            Metric::InnerProduct => -dot_product(a, b)?,
            Metric::L2 => euclidean_distance(a, b)?,
        })
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "cosine" => Ok(Metric::Cosine),
            "ip" | "inner_product" => Ok(Metric::InnerProduct),
            "l2" | "euclidean" => Ok(Metric::L2),
            other => Err(StoreError::UnknownMetric(other.to_string())),
        }
    }
}

/// A bound statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    /// Stored as a little-endian f32 blob.
    Vector(Vec<f32>),
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<usize> for SqlValue {
    fn from(v: usize) -> Self {
        SqlValue::Integer(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Integer(i64::from(v))
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<Vec<f32>> for SqlValue {
    fn from(v: Vec<f32>) -> Self {
        SqlValue::Vector(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(SqlValue::Null, Into::into)
    }
}

impl From<&JsonValue> for SqlValue {
    /// Scalars map directly; arrays and objects are stored as JSON text.
    fn from(v: &JsonValue) -> Self {
        match v {
            JsonValue::Null => SqlValue::Null,
            JsonValue::Bool(b) => SqlValue::from(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => SqlValue::Integer(i),
                None => n.as_f64().map_or(SqlValue::Null, SqlValue::Real),
            },
            JsonValue::String(s) => SqlValue::Text(s.clone()),
            other => SqlValue::Text(other.to_string()),
        }
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            SqlValue::Real(r) => ToSqlOutput::Owned(Value::Real(*r)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Vector(v) => ToSqlOutput::Owned(Value::Blob(encode_vector(v))),
        })
    }
}

/// Little-endian f32 bytes.
pub fn encode_vector(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Inverse of [`encode_vector`].
pub fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(StoreError::CorruptVector(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Convert a SQLite cell into JSON. Blobs that decode as vectors become
/// arrays of numbers; other blobs become null.
pub(crate) fn cell_to_json(value: ValueRef<'_>) -> JsonValue {
    match value {
        ValueRef::Null => JsonValue::Null,
        ValueRef::Integer(i) => JsonValue::from(i),
        ValueRef::Real(r) => serde_json::Number::from_f64(r).map_or(JsonValue::Null, JsonValue::Number),
        ValueRef::Text(t) => JsonValue::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => decode_vector(b)
            .map(|v| JsonValue::from(v.into_iter().map(f64::from).collect::<Vec<_>>()))
            .unwrap_or(JsonValue::Null),
    }
}
