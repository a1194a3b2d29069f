// Copyright (c) Plex Ingestion Engineers
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

/// `(start, now)` for a date-range query: `since` if present, else
/// `now - lookback_days`.
pub fn time_range(since: Option<DateTime<Utc>>, lookback_days: i64) -> (DateTime<Utc>, DateTime<Utc>) {
    let now = Utc::now();
    let start = since.unwrap_or_else(|| now - Duration::days(lookback_days));
    (start, now)
}

/// First non-empty string/number among `record[field]` for `field in fields`.
pub fn first_present<'a>(record: &'a Value, fields: &[&str]) -> Option<&'a Value> {
    fields.iter().find_map(|f| match record.get(*f) {
        Some(Value::Null) | None => None,
        Some(v) if v.is_string() && v.as_str().map(str::is_empty).unwrap_or(true) => None,
        Some(v) => Some(v),
    })
}

/// Render a JSON scalar as a row-key fragment the way the source extractors'
/// `str(value)` coercion does.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_present_skips_nulls_and_empty_strings() {
        let record = json!({"a": null, "b": "", "c": "value"});
        assert_eq!(first_present(&record, &["a", "b", "c"]), Some(&json!("value")));
    }

    #[test]
    fn time_range_defaults_to_lookback_when_since_absent() {
        let (start, now) = time_range(None, 7);
        assert!(now - start >= Duration::days(7));
    }
}
