// Copyright (c) Plex Ingestion Engineers
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use plex_ingestion_core::{Extractor, IngestError, MetadataNode, PlexHttpClient};
use serde_json::{Map, Value};

use super::common::{first_present, stringify, time_range};

pub struct PerformanceExtractor {
    http: PlexHttpClient,
    lookback_days: i64,
    pcn: String,
    facility: String,
}

impl PerformanceExtractor {
    pub fn new(http: PlexHttpClient, lookback_days: i64, pcn: impl Into<String>, facility: impl Into<String>) -> Self {
        Self {
            http,
            lookback_days,
            pcn: pcn.into(),
            facility: facility.into(),
        }
    }

    fn make_entry_key(record: &Value) -> String {
        if let Some(v) = first_present(record, &["entryId", "id"]) {
            return format!("entry:{}", stringify(v));
        }
        let workcenter = first_present(record, &["workcenterId", "workcenter"]).map(stringify).unwrap_or_default();
        let start = first_present(record, &["startTime", "timestamp"]).map(stringify).unwrap_or_default();
        format!("entry:{workcenter}:{start}")
    }

    fn make_summary_key(record: &Value) -> String {
        if let Some(v) = first_present(record, &["summaryId", "id"]) {
            return format!("summary:{}", stringify(v));
        }
        let workcenter = first_present(record, &["workcenterId", "workcenter"]).map(stringify).unwrap_or_default();
        let start = first_present(record, &["startTime", "timestamp"]).map(stringify).unwrap_or_default();
        format!("summary:{workcenter}:{start}")
    }
}

#[async_trait]
impl Extractor for PerformanceExtractor {
    fn name(&self) -> &str {
        "performance"
    }

    fn raw_table_name(&self) -> &str {
        "performance_summaries"
    }

    async fn fetch_records(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Value>, IngestError> {
        let (begin, end) = time_range(since, self.lookback_days.max(365));
        let mut query = BTreeMap::new();
        query.insert("beginDate".to_string(), begin.to_rfc3339());
        query.insert("endDate".to_string(), end.to_rfc3339());
        query.insert("limit".to_string(), "1000".to_string());

        let entries = self
            .http
            .paginate(
                "/production/v1/production-history/production-entries",
                &query,
                Some("data"),
                "offset",
                1000,
            )
            .await?;
        let summaries = self
            .http
            .paginate(
                "/production/v1-beta1/production-history/production-entries-summary",
                &query,
                Some("data"),
                "offset",
                1000,
            )
            .await?;

        let mut combined = Vec::with_capacity(entries.len() + summaries.len());
        for entry in entries {
            let mut map = into_object(entry);
            map.entry("recordType").or_insert_with(|| Value::String("entry".to_string()));
            let key = Self::make_entry_key(&Value::Object(map.clone()));
            map.entry("rowKey").or_insert_with(|| Value::String(key));
            combined.push(Value::Object(map));
        }
        for summary in summaries {
            let mut map = into_object(summary);
            map.entry("recordType").or_insert_with(|| Value::String("summary".to_string()));
            let key = Self::make_summary_key(&Value::Object(map.clone()));
            map.entry("rowKey").or_insert_with(|| Value::String(key));
            combined.push(Value::Object(map));
        }
        Ok(combined)
    }

    fn record_key(&self, record: &Value) -> Result<String, IngestError> {
        if let Some(Value::String(existing)) = record.get("rowKey") {
            return Ok(existing.clone());
        }
        if record.get("recordType").and_then(Value::as_str) == Some("summary") {
            Ok(Self::make_summary_key(record))
        } else {
            Ok(Self::make_entry_key(record))
        }
    }

    fn transform_record(&self, record: Value) -> Result<Value, IngestError> {
        let key = self.record_key(&record)?;
        let mut map = into_object(record);
        map.entry("rowKey").or_insert_with(|| Value::String(key));

        if let Some(code) = map.get("workcenterCode").cloned().filter(|v| !v.is_null()) {
            map.entry("workcenterCode").or_insert(code);
        } else if let Some(Value::Object(wc)) = map.get("workcenter").cloned() {
            if let Some(code) = wc.get("code").cloned().filter(|v| !v.is_null()) {
                map.entry("workcenterCode").or_insert(code);
            }
            if !map.contains_key("workcenterId") {
                if let Some(id) = wc.get("id").cloned().filter(|v| !v.is_null()) {
                    map.entry("workcenterId").or_insert(id);
                }
            }
        }

        for field in ["startTime", "endTime"] {
            if let Some(v) = map.get(field).cloned().filter(|v| !v.is_null()) {
                map.entry(field).or_insert(v);
            }
        }
        for field in [
            "goodQuantity",
            "badQuantity",
            "totalQuantity",
            "runTimeHours",
            "plannedRunTimeHours",
            "downtimeHours",
        ] {
            if let Some(v) = map.get(field).cloned() {
                if !v.is_null() {
                    map.entry(field).or_insert(v);
                }
            }
        }

        map.entry("pcn").or_insert_with(|| Value::String(self.pcn.clone()));
        map.entry("facility").or_insert_with(|| Value::String(self.facility.clone()));
        Ok(Value::Object(map))
    }

    fn extractor_metadata(&self, fetched: usize, written: usize, now: DateTime<Utc>) -> Option<MetadataNode> {
        let _ = (fetched, written);
        Some(MetadataNode {
            external_id: format!("performance-{}", now.timestamp()),
            extracted_data: Map::new(),
        })
    }
}

fn into_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(m) => m,
        other => {
            let mut m = Map::new();
            m.insert("value".to_string(), other);
            m
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn extractor() -> PerformanceExtractor {
        PerformanceExtractor::new(PlexHttpClient::new("https://example.com", "key", "cust"), 7, "CUST1", "PLANT-A")
    }

    #[test]
    fn entry_key_prefers_entry_id_with_prefix() {
        assert_eq!(PerformanceExtractor::make_entry_key(&json!({"entryId": "E1"})), "entry:E1");
        assert_eq!(
            PerformanceExtractor::make_entry_key(&json!({"workcenterId": "WC-1", "startTime": "2024-06-01T00:00:00Z"})),
            "entry:WC-1:2024-06-01T00:00:00Z"
        );
    }

    #[test]
    fn summary_key_uses_summary_prefix() {
        assert_eq!(PerformanceExtractor::make_summary_key(&json!({"summaryId": "S1"})), "summary:S1");
    }

    #[test]
    fn record_key_dispatches_on_record_type() {
        let e = extractor();
        let summary = json!({"recordType": "summary", "summaryId": "S1"});
        assert_eq!(e.record_key(&summary).unwrap(), "summary:S1");
    }
}
