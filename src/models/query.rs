//! Query-related data models.
//!
//! This module defines types for SQL query requests and results.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default row limit for query results.
pub const DEFAULT_ROW_LIMIT: u32 = 100;

/// Hard ceiling on rows returned by one query.
pub const MAX_ROW_LIMIT: u32 = 1000;

/// Default row limit for `sample_data`.
pub const DEFAULT_SAMPLE_LIMIT: u32 = 10;

/// Maximum row limit for `sample_data`.
pub const MAX_SAMPLE_LIMIT: u32 = 100;

/// Maximum query text length in characters.
pub const MAX_QUERY_LENGTH: usize = 100_000;

/// Maximum length of one string parameter in characters.
pub const MAX_PARAM_LENGTH: usize = 10_000;

/// Maximum number of bound parameters.
pub const MAX_PARAMS: usize = 1000;

/// A parameter value for parameterized queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum QueryParam {
    Null,
    Bool(bool),
    /// Stored as i64 for maximum range
    Int(i64),
    Float(f64),
    String(String),
    /// Binary data, written as `{"base64": "..."}` in JSON
    Bytes {
        #[serde(with = "base64_bytes")]
        #[schemars(with = "String")]
        base64: Vec<u8>,
    },
}

impl QueryParam {
    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Self::Bytes {
            base64: data.into(),
        }
    }

    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes { .. } => "bytes",
        }
    }
}

impl From<&str> for QueryParam {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<i64> for QueryParam {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

/// Custom serialization for binary data as base64.
pub(crate) mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// A query against one named backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub backend: String,
    pub sql: String,
    #[serde(default)]
    pub params: Vec<QueryParam>,
    /// Default: 100, max: 1000
    #[serde(default)]
    pub row_limit: Option<u32>,
}

impl QueryRequest {
    /// Create a new query request with default options.
    pub fn new(backend: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            sql: sql.into(),
            params: Vec::new(),
            row_limit: None,
        }
    }

    /// Add a parameter to this query.
    pub fn with_param(mut self, param: impl Into<QueryParam>) -> Self {
        self.params.push(param.into());
        self
    }

    /// Set the row limit.
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.row_limit = Some(limit);
        self
    }
}

/// Backend-independent scalar value.
///
/// Temporal values are ISO-8601 strings; decimals keep their exact digits.
#[derive(Debug, Clone, PartialEq, Serialize, JsonSchema)]
#[serde(untagged)]
pub enum ScalarValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(String),
    Text(String),
    Timestamp(String),
    Date(String),
    Time(String),
    Json(serde_json::Value),
    Binary { base64: String, byte_length: usize },
    /// A non-null value no decoder understood, kept as its raw bytes.
    Opaque {
        native_type: String,
        base64: String,
        byte_length: usize,
    },
}

impl ScalarValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Plain text rendering, used by markdown output.
    pub fn display_text(&self) -> String {
        match self {
            Self::Null => "NULL".to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Decimal(s)
            | Self::Text(s)
            | Self::Timestamp(s)
            | Self::Date(s)
            | Self::Time(s) => s.clone(),
            Self::Json(v) => v.to_string(),
            Self::Binary { byte_length, .. } => format!("<binary {byte_length} bytes>"),
            Self::Opaque {
                native_type,
                byte_length,
                ..
            } => format!("<{native_type} {byte_length} bytes>"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
pub struct ColumnInfo {
    pub name: String,
    /// Backend-native type (e.g., "INT8", "VARCHAR", "TEXT")
    pub declared_type: String,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, declared_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            declared_type: declared_type.into(),
        }
    }
}

/// Normalized, limit-bounded result of one query.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct QueryResult {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Vec<ScalarValue>>,
    pub row_count: usize,
    /// More rows existed upstream than were returned.
    pub truncated: bool,
    pub row_limit: u32,
    pub execution_time_ms: u64,
}

impl QueryResult {
    /// Check if the result is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index of a column by name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_param_types() {
        assert!(QueryParam::Null.is_null());
        assert!(!QueryParam::Bool(true).is_null());
        assert_eq!(QueryParam::Int(42).type_name(), "int");
        assert_eq!(QueryParam::from("hello").type_name(), "string");
        assert_eq!(QueryParam::bytes(vec![1, 2]).type_name(), "bytes");
    }

    #[test]
    fn test_query_param_deserialize() {
        let params: Vec<QueryParam> =
            serde_json::from_str(r#"[null, true, 7, 1.5, "x", {"base64": "AQID"}]"#).unwrap();
        assert_eq!(
            params,
            vec![
                QueryParam::Null,
                QueryParam::Bool(true),
                QueryParam::Int(7),
                QueryParam::Float(1.5),
                QueryParam::String("x".into()),
                QueryParam::bytes(vec![1, 2, 3]),
            ]
        );
    }

    #[test]
    fn test_query_request_builder() {
        let req = QueryRequest::new("local", "SELECT * FROM t WHERE id = ?")
            .with_param(1i64)
            .with_limit(5);
        assert_eq!(req.params, vec![QueryParam::Int(1)]);
        assert_eq!(req.row_limit, Some(5));
    }

    #[test]
    fn test_scalar_value_serialization() {
        let row = vec![
            ScalarValue::Null,
            ScalarValue::Int(3),
            ScalarValue::Decimal("12.50".into()),
            ScalarValue::Binary {
                base64: "AAE=".into(),
                byte_length: 2,
            },
        ];
        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(
            json,
            r#"[null,3,"12.50",{"base64":"AAE=","byte_length":2}]"#
        );
    }
}
