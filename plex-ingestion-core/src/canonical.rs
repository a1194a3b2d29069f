// Copyright (c) Plex Ingestion Engineers
// SPDX-License-Identifier: Apache-2.0

use serde_json::{Map, Value};

/// A landing row: a deterministic key paired with flat, scalar-or-JSON-text
/// columns, ready for [`crate::sink::RawSinkClient::insert_rows`].
pub type Row = (String, Map<String, Value>);

/// Flattens a record into scalar columns: nested objects/arrays become
/// JSON text; every other value (including timestamp strings, which already
/// arrive as ISO-8601 text at the JSON boundary) passes through unchanged.
///
/// Re-canonicalizing an already-canonical record is a no-op:
/// scalars stay scalars, and JSON-text strings are themselves scalars so a
/// second pass leaves them untouched rather than re-encoding them.
pub fn canonicalize(record: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::with_capacity(record.len());
    for (key, value) in record {
        let flattened = match value {
            Value::Object(_) | Value::Array(_) => {
                Value::String(serde_json::to_string(value).expect("Value serialization is infallible"))
            }
            other => other.clone(),
        };
        out.insert(key.clone(), flattened);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flattens_nested_object_to_json_text() {
        let mut record = Map::new();
        record.insert("workcenter".to_string(), json!({"code": "WC-A"}));
        record.insert("id".to_string(), json!("J1"));
        let flat = canonicalize(&record);
        assert_eq!(flat["workcenter"], json!("{\"code\":\"WC-A\"}"));
        assert_eq!(flat["id"], json!("J1"));
    }

    #[test]
    fn flattens_arrays_to_json_text() {
        let mut record = Map::new();
        record.insert("operations".to_string(), json!([{"id": 1}, {"id": 2}]));
        let flat = canonicalize(&record);
        assert_eq!(flat["operations"], json!("[{\"id\":1},{\"id\":2}]"));
    }

    #[test]
    fn scalars_pass_through_unchanged() {
        let mut record = Map::new();
        record.insert("quantityGood".to_string(), json!(10));
        record.insert("ok".to_string(), json!(true));
        record.insert("note".to_string(), Value::Null);
        let flat = canonicalize(&record);
        assert_eq!(flat["quantityGood"], json!(10));
        assert_eq!(flat["ok"], json!(true));
        assert_eq!(flat["note"], Value::Null);
    }

    #[test]
    fn re_canonicalizing_is_idempotent() {
        let mut record = Map::new();
        record.insert("workcenter".to_string(), json!({"code": "WC-A"}));
        let once = canonicalize(&record);
        let twice = canonicalize(&once);
        assert_eq!(once, twice);
    }
}
