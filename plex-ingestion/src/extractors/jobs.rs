// Copyright (c) Plex Ingestion Engineers
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use plex_ingestion_core::{Extractor, IngestError, MetadataNode, PlexHttpClient};
use serde_json::{Map, Value};
use tracing::warn;

use super::common::{first_present, stringify, time_range};

pub struct JobsExtractor {
    http: PlexHttpClient,
    lookback_days: i64,
    pcn: String,
    facility: String,
}

impl JobsExtractor {
    pub fn new(http: PlexHttpClient, lookback_days: i64, pcn: impl Into<String>, facility: impl Into<String>) -> Self {
        Self {
            http,
            lookback_days,
            pcn: pcn.into(),
            facility: facility.into(),
        }
    }

    async fn fetch_operations(&self, job_id: &str) -> Option<Vec<Value>> {
        let path = format!("/scheduling/v1/jobs/{job_id}/operations");
        match self.http.get(&path, &BTreeMap::new()).await {
            Ok(Value::Object(map)) => match map.get("data") {
                Some(Value::Array(items)) => Some(items.clone()),
                _ => None,
            },
            Ok(Value::Array(items)) => Some(items),
            Ok(_) => None,
            Err(err) => {
                warn!(job_id, error = %err, "fetching job operations failed, treating as no operations");
                None
            }
        }
    }

    async fn enrich_with_operations(&self, job: Value) -> Value {
        let job_id = job.as_object().and_then(|m| {
            ["id", "jobId"]
                .iter()
                .find_map(|field| m.get(*field))
                .filter(|v| !v.is_null())
                .map(stringify)
        });
        let Some(id) = job_id else { return job };
        let Some(operations) = self.fetch_operations(&id).await else { return job };
        if operations.is_empty() {
            return job;
        }
        match job {
            Value::Object(mut map) => {
                map.insert("operations".to_string(), Value::Array(operations));
                Value::Object(map)
            }
            other => other,
        }
    }

    fn extract_workcenter(record: &Map<String, Value>) -> Option<String> {
        for key in ["workcenter", "workcenterCode", "workcenterId", "workcenterName"] {
            match record.get(key) {
                Some(Value::String(s)) if !s.trim().is_empty() => return Some(s.clone()),
                Some(Value::Number(n)) => return Some(n.to_string()),
                _ => {}
            }
        }
        if let Some(Value::Object(nested)) = record.get("workcenter") {
            for key in ["code", "id", "name"] {
                if let Some(v) = nested.get(key) {
                    if !v.is_null() {
                        return Some(stringify(v));
                    }
                }
            }
        }
        if let Some(Value::Array(operations)) = record.get("operations") {
            for op in operations {
                if let Value::Object(op) = op {
                    for key in ["workcenterCode", "workcenterId", "workcenterName"] {
                        if let Some(v) = op.get(key) {
                            if !v.is_null() {
                                return Some(stringify(v));
                            }
                        }
                    }
                }
            }
        }
        None
    }

    fn extract_workcenter_field(record: &Map<String, Value>, field: &str, direct_key: &str) -> Option<String> {
        if let Some(Value::Object(nested)) = record.get("workcenter") {
            if let Some(v) = nested.get(field) {
                if !v.is_null() {
                    return Some(stringify(v));
                }
            }
        }
        if let Some(v) = record.get(direct_key) {
            if !v.is_null() {
                return Some(stringify(v));
            }
        }
        if let Some(Value::Array(operations)) = record.get("operations") {
            for op in operations {
                if let Value::Object(op) = op {
                    if let Some(v) = op.get(direct_key) {
                        if !v.is_null() {
                            return Some(stringify(v));
                        }
                    }
                }
            }
        }
        None
    }
}

#[async_trait]
impl Extractor for JobsExtractor {
    fn name(&self) -> &str {
        "jobs"
    }

    fn raw_table_name(&self) -> &str {
        "jobs"
    }

    async fn fetch_records(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Value>, IngestError> {
        let (date_from, date_to) = time_range(since, self.lookback_days);
        let mut query = BTreeMap::new();
        query.insert("dateFrom".to_string(), date_from.to_rfc3339());
        query.insert("dateTo".to_string(), date_to.to_rfc3339());
        query.insert("limit".to_string(), "1000".to_string());

        let jobs = self.http.paginate("/scheduling/v1/jobs", &query, Some("data"), "offset", 1000).await?;

        // Per-job operations are independent GETs; fetch them concurrently rather
        // than one-at-a-time, since a single cycle can cover hundreds of jobs.
        let enriched = join_all(jobs.into_iter().map(|job| self.enrich_with_operations(job))).await;
        Ok(enriched)
    }

    fn record_key(&self, record: &Value) -> Result<String, IngestError> {
        let Some(map) = record.as_object() else {
            return Err(IngestError::MissingIdentifier("job record is not an object".to_string()));
        };
        if let Some(v) = first_present(record, &["id", "jobId"]) {
            return Ok(stringify(v));
        }
        let job_no = first_present(record, &["jobNo", "jobNumber"]);
        let scheduled = first_present(record, &["scheduleStartDate", "scheduledStart"]);
        if job_no.is_none() && scheduled.is_none() {
            return Err(IngestError::MissingIdentifier(format!("job record {map:?} has no id/jobId/jobNo/scheduledStart")));
        }
        Ok(format!(
            "{}-{}",
            job_no.map(stringify).unwrap_or_default(),
            scheduled.map(stringify).unwrap_or_default()
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

        map.entry("rowKey").or_insert_with(|| Value::String(key.clone()));
        map.entry("externalId").or_insert_with(|| Value::String(key));

        if let Some(workcenter) = Self::extract_workcenter(&map) {
            map.entry("workcenter").or_insert_with(|| Value::String(workcenter));
        }
        if let Some(code) = Self::extract_workcenter_field(&map, "code", "workcenterCode") {
            map.entry("workcenterCode").or_insert_with(|| Value::String(code));
        }
        if let Some(id) = Self::extract_workcenter_field(&map, "id", "workcenterId") {
            map.entry("workcenterId").or_insert_with(|| Value::String(id));
        }
        if let Some(nm) = Self::extract_workcenter_field(&map, "name", "workcenterName") {
            map.entry("workcenterName").or_insert_with(|| Value::String(nm));
        }

        if let Some(Value::Array(operations)) = map.get("operations").cloned() {
            if !operations.is_empty() {
                map.entry("operationCount").or_insert_with(|| Value::from(operations.len()));
                map.entry("primaryOperation").or_insert_with(|| operations[0].clone());
            }
        }

        map.entry("pcn").or_insert_with(|| Value::String(self.pcn.clone()));
        map.entry("facility").or_insert_with(|| Value::String(self.facility.clone()));

        Ok(Value::Object(map))
    }

    fn extractor_metadata(&self, fetched: usize, written: usize, now: DateTime<Utc>) -> Option<MetadataNode> {
        let _ = (fetched, written);
        Some(MetadataNode {
            external_id: format!("jobs-{}", now.timestamp()),
            extracted_data: Map::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn extractor() -> JobsExtractor {
        JobsExtractor::new(PlexHttpClient::new("https://example.com", "key", "cust"), 7, "CUST1", "PLANT-A")
    }

    #[test]
    fn record_key_prefers_id_then_job_id() {
        let e = extractor();
        assert_eq!(e.record_key(&json!({"id": "J1"})).unwrap(), "J1");
        assert_eq!(e.record_key(&json!({"jobId": "J2"})).unwrap(), "J2");
    }

    #[test]
    fn record_key_falls_back_to_composite() {
        let e = extractor();
        let key = e
            .record_key(&json!({"jobNo": "N2", "scheduledStart": "2024-06-01T00:00:00Z"}))
            .unwrap();
        assert_eq!(key, "N2-2024-06-01T00:00:00Z");
    }

    #[test]
    fn record_key_missing_everything_errors() {
        let e = extractor();
        assert!(e.record_key(&json!({"status": "open"})).is_err());
    }

    #[test]
    fn transform_extracts_nested_workcenter_code() {
        let e = extractor();
        let out = e.transform_record(json!({"id": "J1", "workcenter": {"code": "WC-A"}})).unwrap();
        assert_eq!(out["workcenterCode"], json!("WC-A"));
        assert_eq!(out["pcn"], json!("CUST1"));
        assert_eq!(out["facility"], json!("PLANT-A"));
    }

    #[test]
    fn transform_does_not_overwrite_existing_fields() {
        let e = extractor();
        let out = e
            .transform_record(json!({"id": "J1", "pcn": "EXPLICIT", "workcenter": {"code": "WC-A"}}))
            .unwrap();
        assert_eq!(out["pcn"], json!("EXPLICIT"));
    }
}
