//! Timestamp encoding shared by every table.
//!
//! Timestamps are stored as RFC 3339 UTC text with a fixed microsecond
//! fraction (`2026-10-17T08:30:00.000000Z`). Every value has the same width,
//! so `ORDER BY created_at` and `WHERE processed_at < ?` compare correctly as
//! plain strings.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::Row;

/// Encodes a timestamp for storage.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Decodes a stored timestamp.
///
/// # Errors
///
/// Returns the chrono parse error for text that is not RFC 3339.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
}

/// Reads a non-null timestamp column from a result row.
///
/// # Errors
///
/// Returns `FromSqlConversionFailure` when the text does not parse.
pub fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Reads a nullable timestamp column from a result row.
///
/// # Errors
///
/// Returns `FromSqlConversionFailure` when the text does not parse.
pub fn optional_timestamp_column(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|value| {
        parse_timestamp(&value)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn encoded_width_is_fixed() {
        let whole = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).single().expect("valid");
        let fractional = whole + Duration::milliseconds(500);
        assert_eq!(format_timestamp(whole), "2026-01-02T03:04:05.000000Z");
        assert_eq!(format_timestamp(fractional), "2026-01-02T03:04:05.500000Z");
        assert_eq!(format_timestamp(whole).len(), format_timestamp(fractional).len());
    }

    #[test]
    fn lexical_order_matches_chronological_order() {
        let base = Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).single().expect("valid");
        let mut stamps: Vec<String> = [
            base + Duration::seconds(61),
            base,
            base + Duration::microseconds(1),
            base + Duration::days(40),
        ]
        .into_iter()
        .map(format_timestamp)
        .collect();
        stamps.sort();

        let parsed: Vec<DateTime<Utc>> = stamps
            .iter()
            .map(|s| parse_timestamp(s).expect("should parse"))
            .collect();
        let mut sorted = parsed.clone();
        sorted.sort();
        assert_eq!(parsed, sorted);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_timestamp("yesterday").is_err());
    }
}
