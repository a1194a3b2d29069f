// Copyright (c) Plex Ingestion Engineers
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use plex_ingestion_core::timestamp::try_parse_timestamp;
use plex_ingestion_core::{Extractor, IngestError, MetadataNode, PlexHttpClient};
use serde_json::{Map, Value};

use super::common::stringify;

struct EndpointConfig {
    record_type: &'static str,
    endpoint: &'static str,
    id_fields: &'static [&'static str],
    timestamp_field: &'static str,
}

const ENDPOINTS: &[EndpointConfig] = &[
    EndpointConfig {
        record_type: "workcenter",
        endpoint: "/production/v1/production-definitions/workcenters",
        id_fields: &["id", "workcenterId", "externalId"],
        timestamp_field: "lastUpdated",
    },
    EndpointConfig {
        record_type: "part",
        endpoint: "/mdm/v1/parts",
        id_fields: &["id", "partId", "partNumber"],
        timestamp_field: "lastUpdatedDate",
    },
    EndpointConfig {
        record_type: "operation",
        endpoint: "/mdm/v1/operations",
        id_fields: &["id", "operationId"],
        timestamp_field: "lastUpdatedDate",
    },
];

pub struct MasterDataExtractor {
    http: PlexHttpClient,
    lookback_days: i64,
    pcn: String,
    facility: String,
}

impl MasterDataExtractor {
    pub fn new(http: PlexHttpClient, lookback_days: i64, pcn: impl Into<String>, facility: impl Into<String>) -> Self {
        Self {
            http,
            lookback_days,
            pcn: pcn.into(),
            facility: facility.into(),
        }
    }

    fn is_after(record: &Map<String, Value>, field: &str, since: DateTime<Utc>) -> bool {
        let timestamp = record
            .get(field)
            .or_else(|| record.get("lastUpdated"))
            .and_then(Value::as_str);
        let Some(timestamp) = timestamp else {
            return true;
        };
        match try_parse_timestamp(&Value::String(timestamp.to_string())) {
            Some(ts) => ts >= since,
            None => true,
        }
    }
}

#[async_trait]
impl Extractor for MasterDataExtractor {
    fn name(&self) -> &str {
        "master_data"
    }

    fn raw_table_name(&self) -> &str {
        "master_data"
    }

    async fn fetch_records(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Value>, IngestError> {
        let effective_since = since.unwrap_or_else(|| Utc::now() - Duration::days(self.lookback_days));

        let mut aggregated = Vec::new();
        for endpoint in ENDPOINTS {
            let mut query = BTreeMap::new();
            query.insert("limit".to_string(), "1000".to_string());
            let payload = self.http.paginate(endpoint.endpoint, &query, Some("data"), "offset", 1000).await?;

            for item in payload {
                let mut map = match item {
                    Value::Object(m) => m,
                    other => {
                        let mut m = Map::new();
                        m.insert("value".to_string(), other);
                        m
                    }
                };
                map.insert("recordType".to_string(), Value::String(endpoint.record_type.to_string()));
                if Self::is_after(&map, endpoint.timestamp_field, effective_since) {
                    if let Ok(key) = record_key(&map) {
                        map.entry("rowKey").or_insert_with(|| Value::String(key));
                        aggregated.push(Value::Object(map));
                    }
                }
            }
        }
        Ok(aggregated)
    }

    fn record_key(&self, record: &Value) -> Result<String, IngestError> {
        let Some(map) = record.as_object() else {
            return Err(IngestError::MissingIdentifier("master data record is not an object".to_string()));
        };
        record_key(map)
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
        map.entry("pcn").or_insert_with(|| Value::String(self.pcn.clone()));
        map.entry("facility").or_insert_with(|| Value::String(self.facility.clone()));
        Ok(Value::Object(map))
    }

    fn extractor_metadata(&self, fetched: usize, written: usize, now: DateTime<Utc>) -> Option<MetadataNode> {
        let _ = (fetched, written);
        Some(MetadataNode {
            external_id: format!("master_data-{}", now.timestamp()),
            extracted_data: Map::new(),
        })
    }
}

fn record_key(record: &Map<String, Value>) -> Result<String, IngestError> {
    let record_type = record.get("recordType").and_then(Value::as_str).unwrap_or("unknown");
    let id_fields = ENDPOINTS
        .iter()
        .find(|cfg| cfg.record_type == record_type)
        .map(|cfg| cfg.id_fields)
        .unwrap_or(&["id"]);
    for field in id_fields {
        if let Some(v) = record.get(*field) {
            if !v.is_null() {
                return Ok(format!("{record_type}:{}", stringify(v)));
            }
        }
    }
    Err(IngestError::MissingIdentifier(format!(
        "master data record missing identifier for type {record_type}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_key_prefixes_with_record_type() {
        let record = json!({"recordType": "part", "partNumber": "P1"});
        let map = record.as_object().unwrap().clone();
        assert_eq!(record_key(&map).unwrap(), "part:P1");
    }

    #[test]
    fn record_key_errors_on_missing_identifier() {
        let record = json!({"recordType": "part"});
        let map = record.as_object().unwrap().clone();
        assert!(record_key(&map).is_err());
    }

    #[test]
    fn is_after_retains_records_with_missing_timestamp() {
        let record = json!({});
        let map = record.as_object().unwrap().clone();
        assert!(MasterDataExtractor::is_after(&map, "lastUpdatedDate", Utc::now()));
    }
}
