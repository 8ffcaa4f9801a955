//! Backend-agnostic type mappings.
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies a native column type into a logical category
//! 2. Driver-specific decoders extract the value into a [`ScalarValue`]
//!
//! [`normalize_type_name`] maps catalog type names into the shared vocabulary
//! reported by `describe_table`.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::mysql::MySqlRow;
use sqlx::postgres::PgRow;
use sqlx::sqlite::SqliteRow;
use sqlx::types::{BigDecimal, Uuid};
use sqlx::{Column, Row, TypeInfo, ValueRef};

use crate::db::normalize;
use crate::models::{BackendType, ColumnInfo, ScalarValue};

// =============================================================================
// Type Classification
// =============================================================================

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Uuid,
    Timestamp,
    /// Timestamp carrying an offset.
    TimestampTz,
    Date,
    Time,
    Unknown,
}

/// Split `varchar(255)` into (`varchar`, Some(`255`)).
fn split_type(type_name: &str) -> (String, Option<String>) {
    let lower = type_name.trim().to_ascii_lowercase();
    let lower = lower
        .trim_end_matches(" zerofill")
        .trim_end_matches(" unsigned")
        .to_string();
    match (lower.find('('), lower.rfind(')')) {
        (Some(open), Some(close)) if close > open => {
            let args = lower[open + 1..close].replace(' ', "");
            let mut base = lower[..open].trim().to_string();
            let rest = lower[close + 1..].trim();
            if !rest.is_empty() {
                base.push(' ');
                base.push_str(rest);
            }
            (base, Some(args))
        }
        _ => (lower, None),
    }
}

fn is_integer_base(base: &str) -> bool {
    matches!(
        base,
        "int" | "integer" | "int2" | "int4" | "int8" | "smallint" | "bigint" | "tinyint"
            | "mediumint" | "serial" | "bigserial" | "smallserial" | "year"
    )
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, backend: BackendType) -> TypeCategory {
    let (base, args) = split_type(type_name);

    if base.starts_with("timestamptz") || base.contains("with time zone") {
        return if base.starts_with("time ") || base == "timetz" {
            TypeCategory::Unknown
        } else {
            TypeCategory::TimestampTz
        };
    }
    if base.starts_with("timestamp") || base == "datetime" {
        // MySQL TIMESTAMP is stored as UTC
        return if backend == BackendType::MySql && base == "timestamp" {
            TypeCategory::TimestampTz
        } else {
            TypeCategory::Timestamp
        };
    }
    if base == "date" {
        return TypeCategory::Date;
    }
    if base == "time" || base == "time without time zone" {
        return TypeCategory::Time;
    }

    // SQLite's NUMERIC affinity holds floats
    if base == "decimal" || base == "numeric" {
        if backend == BackendType::Sqlite && args.is_none() {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }

    if base == "tinyint" && args.as_deref() == Some("1") && backend == BackendType::MySql {
        return TypeCategory::Boolean;
    }
    if is_integer_base(&base) {
        return TypeCategory::Integer;
    }
    if base == "bool" || base == "boolean" {
        return TypeCategory::Boolean;
    }
    if matches!(
        base.as_str(),
        "float" | "float4" | "float8" | "real" | "double" | "double precision" | "decfloat"
    ) {
        return TypeCategory::Float;
    }
    if base == "json" || base == "jsonb" {
        return TypeCategory::Json;
    }
    if base == "uuid" {
        return TypeCategory::Uuid;
    }
    if base.contains("blob")
        || base.contains("binary")
        || base == "bytea"
        || base == "bit"
        || base.ends_with("for bit data")
    {
        return TypeCategory::Binary;
    }
    if base.contains("char")
        || base.contains("text")
        || base.contains("clob")
        || base.contains("graphic")
        || matches!(base.as_str(), "name" | "enum" | "set" | "string" | "citext")
    {
        return TypeCategory::Text;
    }

    TypeCategory::Unknown
}

// =============================================================================
// Type Normalization
// =============================================================================

/// Map a catalog type name into the shared vocabulary.
///
/// Decimals keep their precision and scale; unknown types pass through lowercased.
pub fn normalize_type_name(type_name: &str, backend: BackendType) -> String {
    let (base, args) = split_type(type_name);

    match categorize_type(type_name, backend) {
        TypeCategory::Integer => "integer".to_string(),
        TypeCategory::Float => "float".to_string(),
        TypeCategory::Decimal => match args {
            Some(args) if args.contains(',') => format!("decimal({args})"),
            Some(args) if !args.is_empty() => format!("decimal({args},0)"),
            _ => "decimal".to_string(),
        },
        TypeCategory::Boolean => "boolean".to_string(),
        TypeCategory::Text => "text".to_string(),
        TypeCategory::Binary => {
            // bit(1) is a flag, wider bit strings are binary
            if base == "bit" && matches!(args.as_deref(), None | Some("1")) {
                "boolean".to_string()
            } else {
                "binary".to_string()
            }
        }
        TypeCategory::Json => "json".to_string(),
        TypeCategory::Uuid => "uuid".to_string(),
        TypeCategory::Timestamp | TypeCategory::TimestampTz => "timestamp".to_string(),
        TypeCategory::Date => "date".to_string(),
        TypeCategory::Time => "time".to_string(),
        TypeCategory::Unknown => type_name.trim().to_ascii_lowercase(),
    }
}

// =============================================================================
// Row Decoding
// =============================================================================

/// Column metadata and values of a driver row.
pub trait RowDecode {
    fn column_info(&self) -> Vec<ColumnInfo>;
    fn decode_values(&self) -> Vec<ScalarValue>;
}

/// Name and native type of each column.
pub fn column_infos<C: Column>(columns: &[C]) -> Vec<ColumnInfo> {
    columns
        .iter()
        .map(|col| ColumnInfo::new(col.name(), col.type_info().name()))
        .collect()
}

/// Last resort for a non-null value: its bytes as text when they are UTF-8,
/// otherwise an opaque value carrying the native type.
fn undecodable(type_name: &str, idx: usize, bytes: Option<&[u8]>) -> ScalarValue {
    tracing::warn!(column = idx, type_name, "No decoder for column type, returning raw value");
    let bytes = bytes.unwrap_or_default();
    match std::str::from_utf8(bytes) {
        Ok(text) if !text.contains('\0') => ScalarValue::Text(text.to_string()),
        _ => normalize::opaque(type_name, bytes),
    }
}

/// `_int4` in catalogs, `INT4[]` from the driver.
fn is_array_type(type_name: &str) -> bool {
    type_name.starts_with('_') || type_name.ends_with("[]")
}

impl RowDecode for PgRow {
    fn column_info(&self) -> Vec<ColumnInfo> {
        column_infos(self.columns())
    }

    fn decode_values(&self) -> Vec<ScalarValue> {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                let category = categorize_type(type_name, BackendType::Postgres);
                postgres::decode_column(self, idx, type_name, category)
            })
            .collect()
    }
}

impl RowDecode for MySqlRow {
    fn column_info(&self) -> Vec<ColumnInfo> {
        column_infos(self.columns())
    }

    fn decode_values(&self) -> Vec<ScalarValue> {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                let category = categorize_type(type_name, BackendType::MySql);
                mysql::decode_column(self, idx, type_name, category)
            })
            .collect()
    }
}

impl RowDecode for SqliteRow {
    fn column_info(&self) -> Vec<ColumnInfo> {
        column_infos(self.columns())
    }

    fn decode_values(&self) -> Vec<ScalarValue> {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let declared = categorize_type(col.type_info().name(), BackendType::Sqlite);
                sqlite::decode_column(self, idx, declared)
            })
            .collect()
    }
}

mod postgres {
    use sqlx::postgres::PgValueFormat;
    use sqlx::postgres::types::{Oid, PgInterval, PgMoney};

    use super::*;

    pub fn decode_column(
        row: &PgRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> ScalarValue {
        if row.try_get_raw(idx).map_or(true, |v| v.is_null()) {
            return ScalarValue::Null;
        }
        let decoded = match category {
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Decimal => row
                .try_get::<BigDecimal, _>(idx)
                .ok()
                .map(|v| normalize::decimal(&v)),
            TypeCategory::Float => row
                .try_get::<f64, _>(idx)
                .or_else(|_| row.try_get::<f32, _>(idx).map(f64::from))
                .ok()
                .map(normalize::float),
            TypeCategory::Boolean => row.try_get::<bool, _>(idx).ok().map(ScalarValue::Bool),
            TypeCategory::Binary => row
                .try_get::<Vec<u8>, _>(idx)
                .ok()
                .map(|v| normalize::binary(&v)),
            TypeCategory::Json => row
                .try_get::<serde_json::Value, _>(idx)
                .ok()
                .map(ScalarValue::Json),
            TypeCategory::Uuid => row
                .try_get::<Uuid, _>(idx)
                .ok()
                .map(|v| ScalarValue::Text(v.to_string())),
            TypeCategory::Timestamp => row
                .try_get::<NaiveDateTime, _>(idx)
                .ok()
                .map(normalize::timestamp),
            TypeCategory::TimestampTz => row
                .try_get::<DateTime<Utc>, _>(idx)
                .ok()
                .map(normalize::timestamp_utc),
            TypeCategory::Date => row.try_get::<NaiveDate, _>(idx).ok().map(normalize::date),
            TypeCategory::Time => row.try_get::<NaiveTime, _>(idx).ok().map(normalize::time),
            TypeCategory::Text | TypeCategory::Unknown => decode_other(row, idx, type_name),
        };
        decoded.unwrap_or_else(|| raw_value(row, idx, type_name))
    }

    /// Text, plus the PostgreSQL types outside the shared categories.
    fn decode_other(row: &PgRow, idx: usize, type_name: &str) -> Option<ScalarValue> {
        if let Ok(v) = row.try_get::<String, _>(idx) {
            return Some(ScalarValue::Text(v));
        }
        match type_name.to_ascii_uppercase().as_str() {
            "INTERVAL" => row
                .try_get::<PgInterval, _>(idx)
                .ok()
                .map(|v| ScalarValue::Text(interval_iso8601(&v))),
            "MONEY" => row
                .try_get::<PgMoney, _>(idx)
                .ok()
                .map(|v| ScalarValue::Decimal(money_text(v.0))),
            "OID" => row
                .try_get::<Oid, _>(idx)
                .ok()
                .map(|v| ScalarValue::Int(v.0.into())),
            name if is_array_type(name) => decode_array(row, idx),
            _ => None,
        }
    }

    fn json_array<T: Into<serde_json::Value>>(items: Vec<Option<T>>) -> ScalarValue {
        ScalarValue::Json(serde_json::Value::Array(
            items
                .into_iter()
                .map(|v| v.map_or(serde_json::Value::Null, Into::into))
                .collect(),
        ))
    }

    /// One-dimensional arrays of scalar element types, as JSON arrays.
    fn decode_array(row: &PgRow, idx: usize) -> Option<ScalarValue> {
        if let Ok(v) = row.try_get::<Vec<Option<i16>>, _>(idx) {
            return Some(json_array(v));
        }
        if let Ok(v) = row.try_get::<Vec<Option<i32>>, _>(idx) {
            return Some(json_array(v));
        }
        if let Ok(v) = row.try_get::<Vec<Option<i64>>, _>(idx) {
            return Some(json_array(v));
        }
        if let Ok(v) = row.try_get::<Vec<Option<f32>>, _>(idx) {
            return Some(json_array(v));
        }
        if let Ok(v) = row.try_get::<Vec<Option<f64>>, _>(idx) {
            return Some(json_array(v));
        }
        if let Ok(v) = row.try_get::<Vec<Option<bool>>, _>(idx) {
            return Some(json_array(v));
        }
        if let Ok(v) = row.try_get::<Vec<Option<String>>, _>(idx) {
            return Some(json_array(v));
        }
        if let Ok(v) = row.try_get::<Vec<Option<BigDecimal>>, _>(idx) {
            return Some(json_array(
                v.into_iter().map(|d| d.map(|d| d.to_string())).collect(),
            ));
        }
        row.try_get::<Vec<Option<Uuid>>, _>(idx)
            .ok()
            .map(|v| json_array(v.into_iter().map(|u| u.map(|u| u.to_string())).collect()))
    }

    /// Text-format values are already the server's rendering; binary ones are kept opaque.
    fn raw_value(row: &PgRow, idx: usize, type_name: &str) -> ScalarValue {
        match row.try_get_raw(idx) {
            Ok(value) if matches!(value.format(), PgValueFormat::Text) => match value.as_str() {
                Ok(text) => ScalarValue::Text(text.to_string()),
                Err(_) => undecodable(type_name, idx, value.as_bytes().ok()),
            },
            Ok(value) => {
                tracing::warn!(column = idx, type_name, "No decoder for column type, returning raw value");
                normalize::opaque(type_name, value.as_bytes().unwrap_or_default())
            }
            Err(_) => undecodable(type_name, idx, None),
        }
    }

    /// ISO-8601 duration, e.g. `P1M2DT3.5S`.
    pub(super) fn interval_iso8601(interval: &PgInterval) -> String {
        let sign = if interval.microseconds < 0 { "-" } else { "" };
        let micros = interval.microseconds.unsigned_abs();
        let (secs, frac) = (micros / 1_000_000, micros % 1_000_000);
        let seconds = if frac == 0 {
            format!("{sign}{secs}")
        } else {
            let frac = format!("{frac:06}");
            format!("{sign}{secs}.{}", frac.trim_end_matches('0'))
        };
        format!("P{}M{}DT{seconds}S", interval.months, interval.days)
    }

    /// MONEY is a count of cents.
    pub(super) fn money_text(cents: i64) -> String {
        let sign = if cents < 0 { "-" } else { "" };
        let abs = cents.unsigned_abs();
        format!("{sign}{}.{:02}", abs / 100, abs % 100)
    }

    fn decode_integer(row: &PgRow, idx: usize) -> Option<ScalarValue> {
        if let Ok(v) = row.try_get::<i16, _>(idx) {
            return Some(ScalarValue::Int(v.into()));
        }
        if let Ok(v) = row.try_get::<i32, _>(idx) {
            return Some(ScalarValue::Int(v.into()));
        }
        row.try_get::<i64, _>(idx).ok().map(ScalarValue::Int)
    }
}

mod mysql {
    use super::*;

    pub fn decode_column(
        row: &MySqlRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> ScalarValue {
        if row.try_get_raw(idx).map_or(true, |v| v.is_null()) {
            return ScalarValue::Null;
        }
        let decoded = match category {
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Decimal => row
                .try_get::<BigDecimal, _>(idx)
                .ok()
                .map(|v| normalize::decimal(&v)),
            TypeCategory::Float => row
                .try_get::<f64, _>(idx)
                .or_else(|_| row.try_get::<f32, _>(idx).map(f64::from))
                .ok()
                .map(normalize::float),
            TypeCategory::Boolean => row
                .try_get::<bool, _>(idx)
                .ok()
                .map(ScalarValue::Bool)
                .or_else(|| decode_integer(row, idx)),
            TypeCategory::Binary => row
                .try_get::<Vec<u8>, _>(idx)
                .ok()
                .map(|v| normalize::binary(&v)),
            TypeCategory::Json => row
                .try_get::<serde_json::Value, _>(idx)
                .ok()
                .map(ScalarValue::Json),
            TypeCategory::Timestamp => row
                .try_get::<NaiveDateTime, _>(idx)
                .ok()
                .map(normalize::timestamp),
            TypeCategory::TimestampTz => row
                .try_get::<DateTime<Utc>, _>(idx)
                .ok()
                .map(normalize::timestamp_utc),
            TypeCategory::Date => row.try_get::<NaiveDate, _>(idx).ok().map(normalize::date),
            TypeCategory::Time => row.try_get::<NaiveTime, _>(idx).ok().map(normalize::time),
            TypeCategory::Text | TypeCategory::Uuid | TypeCategory::Unknown => {
                decode_text(row, idx)
            }
        };
        decoded.unwrap_or_else(|| {
            let bytes = row.try_get_unchecked::<Vec<u8>, _>(idx).ok();
            undecodable(type_name, idx, bytes.as_deref())
        })
    }

    fn decode_integer(row: &MySqlRow, idx: usize) -> Option<ScalarValue> {
        if let Ok(v) = row.try_get::<i8, _>(idx) {
            return Some(ScalarValue::Int(v.into()));
        }
        if let Ok(v) = row.try_get::<i16, _>(idx) {
            return Some(ScalarValue::Int(v.into()));
        }
        if let Ok(v) = row.try_get::<i32, _>(idx) {
            return Some(ScalarValue::Int(v.into()));
        }
        if let Ok(v) = row.try_get::<i64, _>(idx) {
            return Some(ScalarValue::Int(v));
        }
        if let Ok(v) = row.try_get::<u8, _>(idx) {
            return Some(ScalarValue::Int(v.into()));
        }
        if let Ok(v) = row.try_get::<u16, _>(idx) {
            return Some(ScalarValue::Int(v.into()));
        }
        if let Ok(v) = row.try_get::<u32, _>(idx) {
            return Some(ScalarValue::Int(v.into()));
        }
        row.try_get::<u64, _>(idx).ok().map(normalize::unsigned)
    }

    /// Text columns with a binary collation arrive as bytes.
    fn decode_text(row: &MySqlRow, idx: usize) -> Option<ScalarValue> {
        if let Ok(v) = row.try_get::<String, _>(idx) {
            return Some(ScalarValue::Text(v));
        }
        row.try_get_unchecked::<Vec<u8>, _>(idx)
            .ok()
            .map(|bytes| match String::from_utf8(bytes) {
                Ok(s) => ScalarValue::Text(s),
                Err(e) => normalize::binary(e.as_bytes()),
            })
    }
}

mod sqlite {
    use super::*;

    /// SQLite is dynamically typed, so the stored value's class drives decoding
    /// and the declared type only refines it.
    pub fn decode_column(row: &SqliteRow, idx: usize, declared: TypeCategory) -> ScalarValue {
        let storage = match row.try_get_raw(idx) {
            Ok(value) if value.is_null() => return ScalarValue::Null,
            Ok(value) => value.type_info().name().to_ascii_uppercase(),
            Err(_) => return ScalarValue::Null,
        };

        let decoded = match storage.as_str() {
            "INTEGER" | "BOOLEAN" => row.try_get::<i64, _>(idx).ok().map(|v| match declared {
                TypeCategory::Boolean => ScalarValue::Bool(v != 0),
                _ => ScalarValue::Int(v),
            }),
            "REAL" => row.try_get::<f64, _>(idx).ok().map(normalize::float),
            "BLOB" => row
                .try_get::<Vec<u8>, _>(idx)
                .ok()
                .map(|v| normalize::binary(&v)),
            _ => row.try_get::<String, _>(idx).ok().map(|text| match declared {
                TypeCategory::Timestamp | TypeCategory::TimestampTz => ScalarValue::Timestamp(text),
                TypeCategory::Date => ScalarValue::Date(text),
                TypeCategory::Time => ScalarValue::Time(text),
                TypeCategory::Decimal => ScalarValue::Decimal(text),
                TypeCategory::Json => serde_json::from_str(&text)
                    .map(ScalarValue::Json)
                    .unwrap_or(ScalarValue::Text(text)),
                _ => ScalarValue::Text(text),
            }),
        };
        decoded.unwrap_or_else(|| {
            let bytes = row.try_get_unchecked::<Vec<u8>, _>(idx).ok();
            undecodable(&storage, idx, bytes.as_deref())
        })
    }
}
