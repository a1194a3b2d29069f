// Copyright (c) Plex Ingestion Engineers
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use plex_ingestion_core::{Extractor, IngestError, MetadataNode, PlexHttpClient};
use serde_json::{Map, Value};

use super::common::{first_present, stringify, time_range};

pub struct ProductionExtractor {
    http: PlexHttpClient,
    lookback_days: i64,
    pcn: String,
    facility: String,
}

impl ProductionExtractor {
    pub fn new(http: PlexHttpClient, lookback_days: i64, pcn: impl Into<String>, facility: impl Into<String>) -> Self {
        Self {
            http,
            lookback_days,
            pcn: pcn.into(),
            facility: facility.into(),
        }
    }
}

#[async_trait]
impl Extractor for ProductionExtractor {
    fn name(&self) -> &str {
        "production"
    }

    fn raw_table_name(&self) -> &str {
        "production_entries"
    }

    async fn fetch_records(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Value>, IngestError> {
        let (begin, end) = time_range(since, self.lookback_days);
        let mut query = BTreeMap::new();
        query.insert("beginDate".to_string(), begin.to_rfc3339());
        query.insert("endDate".to_string(), end.to_rfc3339());
        query.insert("limit".to_string(), "1000".to_string());

        self.http
            .paginate(
                "/production/v1/production-history/production-entries",
                &query,
                Some("data"),
                "offset",
                1000,
            )
            .await
    }

    fn record_key(&self, record: &Value) -> Result<String, IngestError> {
        if let Some(v) = first_present(record, &["id", "entryId"]) {
            return Ok(stringify(v));
        }
        let workcenter_id = first_present(record, &["workcenterId"]);
        let ts = first_present(record, &["timestamp", "createdAt"]);
        if workcenter_id.is_none() && ts.is_none() {
            return Err(IngestError::MissingIdentifier("production entry has no id/entryId/workcenterId/timestamp".to_string()));
        }
        Ok(format!(
            "{}-{}",
            workcenter_id.map(stringify).unwrap_or_default(),
            ts.map(stringify).unwrap_or_default()
        ))
    }

    fn transform_record(&self, record: Value) -> Result<Value, IngestError> {
        let key = self.record_key(&record)?;
        let mut map = match record {
            Value::Object(m) => m,
            other => {
                let mut m = Map::new();
                m.insert("value".to_string(), other);
                m
            }
        };

        map.entry("rowKey").or_insert_with(|| Value::String(key));

        if let Some(job_id) = map.get("jobId").cloned().filter(|v| !v.is_null()) {
            map.entry("jobId").or_insert_with(|| job_id.clone());
            let pcn = self.pcn.clone();
            map.entry("jobExternalId")
                .or_insert_with(|| Value::String(format!("{pcn}_JOB_{}", stringify(&job_id))));
        }

        for field in ["workcenterCode", "workcenterName"] {
            if let Some(v) = map.get(field).cloned().filter(|v| !v.is_null()) {
                map.entry(field).or_insert(v);
            }
        }
        if !map.contains_key("workcenterCode") {
            if let Some(Value::Object(wc)) = map.get("workcenter").cloned() {
                if let Some(code) = wc.get("code").cloned().filter(|v| !v.is_null()) {
                    map.entry("workcenterCode").or_insert(code);
                }
                if let Some(name) = wc.get("name").cloned().filter(|v| !v.is_null()) {
                    map.entry("workcenterName").or_insert(name);
                }
                if let Some(id) = wc.get("id").cloned().filter(|v| !v.is_null()) {
                    map.entry("workcenterId").or_insert(id);
                }
            }
        }

        let status = map
            .get("status")
            .cloned()
            .filter(|v| !v.is_null())
            .or_else(|| map.get("entryStatus").cloned().filter(|v| !v.is_null()));
        if let Some(status) = status {
            map.entry("status").or_insert(status);
        }

        for (raw_field, target_field) in [
            ("startTime", "startTime"),
            ("endTime", "endTime"),
            ("createdTime", "createdAt"),
            ("completedTime", "completedAt"),
        ] {
            if let Some(v) = map.get(raw_field).cloned().filter(|v| !v.is_null()) {
                map.entry(target_field).or_insert(v);
            }
        }
        for field in ["quantityGood", "quantityRejected", "sequenceNumber"] {
            if let Some(v) = map.get(field).cloned() {
                if !v.is_null() {
                    map.entry(field).or_insert(v);
                }
            }
        }
        for field in ["shiftId", "operatorId", "productionLineId"] {
            if let Some(v) = map.get(field).cloned().filter(|v| !v.is_null()) {
                map.entry(field).or_insert(v);
            }
        }

        map.entry("pcn").or_insert_with(|| Value::String(self.pcn.clone()));
        map.entry("facility").or_insert_with(|| Value::String(self.facility.clone()));

        Ok(Value::Object(map))
    }

    fn extractor_metadata(&self, fetched: usize, written: usize, now: DateTime<Utc>) -> Option<MetadataNode> {
        let _ = (fetched, written);
        Some(MetadataNode {
            external_id: format!("production-{}", now.timestamp()),
            extracted_data: Map::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn extractor() -> ProductionExtractor {
        ProductionExtractor::new(PlexHttpClient::new("https://example.com", "key", "cust"), 3, "CUST1", "PLANT-A")
    }

    #[test]
    fn row_key_prefers_id_then_entry_id_then_composite() {
        let e = extractor();
        assert_eq!(e.record_key(&json!({"id": "E1"})).unwrap(), "E1");
        assert_eq!(e.record_key(&json!({"entryId": "E2"})).unwrap(), "E2");
        assert_eq!(
            e.record_key(&json!({"workcenterId": "WC-1", "timestamp": "2024-05-31T12:00:00Z"})).unwrap(),
            "WC-1-2024-05-31T12:00:00Z"
        );
    }

    #[test]
    fn transform_preserves_scalar_quantity_and_stamps_facility() {
        let e = extractor();
        let out = e
            .transform_record(json!({"id": "E1", "timestamp": "2024-05-31T12:00:00Z", "quantityGood": 10}))
            .unwrap();
        assert_eq!(out["quantityGood"], json!(10));
        assert_eq!(out["facility"], json!("PLANT-A"));
    }
}
