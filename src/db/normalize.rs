//! Result normalization.
//!
//! Adapters hand over a [`RawResultSet`] holding at most `row_limit + 1`
//! decoded rows; [`normalize`] turns it into the bounded [`QueryResult`].

use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use sqlx::types::BigDecimal;

use crate::models::{ColumnInfo, QueryResult, ScalarValue};

/// Rows and column metadata as fetched from a driver.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawResultSet {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Vec<ScalarValue>>,
}

impl RawResultSet {
    pub fn new(columns: Vec<ColumnInfo>, rows: Vec<Vec<ScalarValue>>) -> Self {
        Self { columns, rows }
    }
}

/// Bound a raw result set to `row_limit` rows.
///
/// `truncated` is set when the adapter fetched more rows than the limit, which
/// it does by fetching one extra row.
pub fn normalize(raw: RawResultSet, row_limit: u32, elapsed: Duration) -> QueryResult {
    let RawResultSet { columns, mut rows } = raw;
    let limit = row_limit as usize;
    let truncated = rows.len() > limit;
    rows.truncate(limit);

    QueryResult {
        columns,
        row_count: rows.len(),
        rows,
        truncated,
        row_limit,
        execution_time_ms: elapsed.as_millis() as u64,
    }
}

pub fn binary(bytes: &[u8]) -> ScalarValue {
    ScalarValue::Binary {
        base64: STANDARD.encode(bytes),
        byte_length: bytes.len(),
    }
}

/// Raw bytes tagged with the column's native type.
pub fn opaque(native_type: &str, bytes: &[u8]) -> ScalarValue {
    ScalarValue::Opaque {
        native_type: native_type.to_string(),
        base64: STANDARD.encode(bytes),
        byte_length: bytes.len(),
    }
}

pub fn decimal(value: &BigDecimal) -> ScalarValue {
    ScalarValue::Decimal(value.to_string())
}

/// NaN and infinities have no JSON number form.
pub fn float(value: f64) -> ScalarValue {
    if value.is_finite() {
        ScalarValue::Float(value)
    } else {
        ScalarValue::Text(value.to_string())
    }
}

pub fn unsigned(value: u64) -> ScalarValue {
    match i64::try_from(value) {
        Ok(v) => ScalarValue::Int(v),
        Err(_) => ScalarValue::Decimal(value.to_string()),
    }
}

pub fn timestamp(value: NaiveDateTime) -> ScalarValue {
    ScalarValue::Timestamp(value.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
}

pub fn timestamp_utc(value: DateTime<Utc>) -> ScalarValue {
    ScalarValue::Timestamp(value.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

pub fn date(value: NaiveDate) -> ScalarValue {
    ScalarValue::Date(value.format("%Y-%m-%d").to_string())
}

pub fn time(value: NaiveTime) -> ScalarValue {
    ScalarValue::Time(value.format("%H:%M:%S%.f").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn rows(n: usize) -> RawResultSet {
        RawResultSet::new(
            vec![ColumnInfo::new("id", "INTEGER")],
            (0..n).map(|i| vec![ScalarValue::Int(i as i64)]).collect(),
        )
    }

    #[test]
    fn test_over_fetch_is_truncated() {
        let result = normalize(rows(3), 2, Duration::from_millis(5));
        assert_eq!(result.row_count, 2);
        assert_eq!(result.rows.len(), 2);
        assert!(result.truncated);
        assert_eq!(result.execution_time_ms, 5);
    }

    #[test]
    fn test_exact_fit_is_not_truncated() {
        for (available, limit) in [(0, 1), (2, 2), (1, 5), (5, 5)] {
            let result = normalize(rows(available), limit, Duration::ZERO);
            assert_eq!(result.row_count, available.min(limit as usize));
            assert!(!result.truncated, "{available} rows under limit {limit}");
        }
    }

    #[test]
    fn test_heavy_over_fetch_still_bounded() {
        let result = normalize(rows(50), 10, Duration::ZERO);
        assert_eq!(result.row_count, 10);
        assert!(result.truncated);
    }

    #[test]
    fn test_binary_is_lossless() {
        let bytes: Vec<u8> = (0..=255).collect();
        match binary(&bytes) {
            ScalarValue::Binary {
                base64,
                byte_length,
            } => {
                assert_eq!(byte_length, 256);
                assert_eq!(STANDARD.decode(base64).unwrap(), bytes);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decimal_keeps_digits() {
        let value = BigDecimal::from_str("123456789012345678901234567890.123456789").unwrap();
        assert_eq!(
            decimal(&value),
            ScalarValue::Decimal("123456789012345678901234567890.123456789".into())
        );
    }

    #[test]
    fn test_float_and_unsigned_edges() {
        assert_eq!(float(f64::NAN), ScalarValue::Text("NaN".into()));
        assert_eq!(float(f64::NEG_INFINITY), ScalarValue::Text("-inf".into()));
        assert_eq!(float(1.5), ScalarValue::Float(1.5));
        assert_eq!(unsigned(7), ScalarValue::Int(7));
        assert_eq!(
            unsigned(u64::MAX),
            ScalarValue::Decimal("18446744073709551615".into())
        );
    }

    #[test]
    fn test_temporal_iso_format() {
        let ts = NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(14, 5, 0)
            .unwrap();
        assert_eq!(timestamp(ts), ScalarValue::Timestamp("2024-03-09T14:05:00".into()));
        assert_eq!(
            timestamp_utc(ts.and_utc()),
            ScalarValue::Timestamp("2024-03-09T14:05:00Z".into())
        );
        assert_eq!(date(ts.date()), ScalarValue::Date("2024-03-09".into()));
        assert_eq!(time(ts.time()), ScalarValue::Time("14:05:00".into()));
    }
}
