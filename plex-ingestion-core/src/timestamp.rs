// Copyright (c) Plex Ingestion Engineers
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::error::IngestError;

/// Parses a JSON value as a UTC timestamp.
///
/// Accepts a numeric value (UNIX seconds), or a string in ISO-8601 with a
/// trailing `Z` normalized to `+00:00`. Any other shape fails with
/// [`IngestError::UnsupportedTimestamp`].
pub fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, IngestError> {
    match value {
        Value::Number(n) => {
            let secs = n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .ok_or_else(|| IngestError::UnsupportedTimestamp(value.to_string()))?;
            Utc.timestamp_opt(secs, 0)
                .single()
                .ok_or_else(|| IngestError::UnsupportedTimestamp(value.to_string()))
        }
        Value::String(s) => parse_timestamp_str(s),
        other => Err(IngestError::UnsupportedTimestamp(other.to_string())),
    }
}

/// As [`parse_timestamp`], but takes a plain string (used where a record
/// field is known to be textual, e.g. after extraction from a table row).
pub fn parse_timestamp_str(s: &str) -> Result<DateTime<Utc>, IngestError> {
    let normalized = s.replace('Z', "+00:00");
    DateTime::parse_from_rfc3339(&normalized)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| IngestError::UnsupportedTimestamp(s.to_string()))
}

/// Best-effort parse used by filters that treat an unparsable timestamp as
/// "retain the record" rather than as a hard error.
pub fn try_parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    parse_timestamp(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_iso8601_with_z() {
        let v = Value::String("2024-06-01T00:00:00Z".to_string());
        let parsed = parse_timestamp(&v).unwrap();
        assert_eq!(parsed.to_rfc3339(), "2024-06-01T00:00:00+00:00");
    }

    #[test]
    fn parses_unix_seconds() {
        let v = Value::from(1_717_200_000i64);
        let parsed = parse_timestamp(&v).unwrap();
        assert_eq!(parsed.timestamp(), 1_717_200_000);
    }

    #[test]
    fn rejects_unsupported_shape() {
        let v = Value::Bool(true);
        assert!(parse_timestamp(&v).is_err());
    }
}
