//! Encoding applied uniformly at the persistence boundary
//!
//! Structured columns are stored as JSON text. Maps keyed by page number are stringified on
//! the way in and parsed back on the way out, so callers never sanitize keys themselves.
//! Timestamps are fixed-width RFC 3339 UTC with microseconds, which keeps lexicographic
//! comparison in SQL equal to chronological order.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Error, Result};

pub fn encode_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| Error::storage(format!("Invalid timestamp '{}': {}", raw, e)))
}

pub fn encode_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| Error::storage(format!("Failed to encode column: {}", e)))
}

pub fn decode_json<T: DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| Error::storage(format!("Failed to decode column: {}", e)))
}

pub fn decode_opt_json<T: DeserializeOwned>(raw: Option<String>) -> Result<Option<T>> {
    raw.as_deref().map(decode_json).transpose()
}

pub fn decode_opt_timestamp(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(decode_timestamp).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RunResult;
    use chrono::TimeZone;

    #[test]
    fn test_timestamps_sort_lexicographically() {
        let early = Utc.with_ymd_and_hms(2024, 3, 9, 23, 59, 59).unwrap();
        let late = early + chrono::Duration::microseconds(1);

        let (a, b) = (encode_timestamp(&early), encode_timestamp(&late));
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert_eq!(a, "2024-03-09T23:59:59.000000Z");
        assert_eq!(decode_timestamp(&b).unwrap(), late);
    }

    #[test]
    fn test_page_keyed_maps_survive_the_boundary() {
        let mut result = RunResult::default();
        result
            .scale_data
            .entry(7)
            .or_default()
            .insert("South Elevation".to_string(), 12.5);

        let encoded = encode_json(&result).unwrap();
        assert!(encoded.contains(r#""7":{"South Elevation":12.5}"#));

        let decoded: RunResult = decode_json(&encoded).unwrap();
        assert_eq!(decoded.scale_data[&7]["South Elevation"], 12.5);
    }

    #[test]
    fn test_bad_column_is_storage_error() {
        let err = decode_json::<RunResult>("{not json").unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert!(decode_timestamp("yesterday").is_err());
    }
}
