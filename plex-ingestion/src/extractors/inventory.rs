// Copyright (c) Plex Ingestion Engineers
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use plex_ingestion_core::timestamp::try_parse_timestamp;
use plex_ingestion_core::{Extractor, IngestError, MetadataNode, PlexHttpClient};
use serde_json::{Map, Value};

use super::common::{first_present, stringify};

pub struct InventoryExtractor {
    http: PlexHttpClient,
    lookback_days: i64,
    pcn: String,
    facility: String,
}

impl InventoryExtractor {
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
impl Extractor for InventoryExtractor {
    fn name(&self) -> &str {
        "inventory"
    }

    fn raw_table_name(&self) -> &str {
        "inventory_containers"
    }

    async fn fetch_records(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Value>, IngestError> {
        let mut query = BTreeMap::new();
        query.insert("limit".to_string(), "1000".to_string());

        let effective_since = since.or_else(|| {
            if self.lookback_days > 0 {
                Some(Utc::now() - Duration::days(self.lookback_days))
            } else {
                None
            }
        });

        let records = self
            .http
            .paginate("/inventory/v1/inventory-tracking/containers", &query, Some("data"), "offset", 1000)
            .await?;

        let Some(effective_since) = effective_since else {
            return Ok(records);
        };

        Ok(records
            .into_iter()
            .filter(|record| {
                let timestamp = first_present(record, &["lastUpdatedDate", "lastUpdated"]);
                let Some(timestamp) = timestamp else {
                    return true;
                };
                match timestamp.as_str().and_then(|s| try_parse_timestamp(&Value::String(s.to_string()))) {
                    Some(ts) => ts >= effective_since,
                    None => true,
                }
            })
            .collect())
    }

    fn record_key(&self, record: &Value) -> Result<String, IngestError> {
        if let Some(v) = first_present(record, &["id", "containerId", "container"]) {
            return Ok(stringify(v));
        }
        let part = first_present(record, &["partNumber"]);
        let location = first_present(record, &["locationId"]);
        if part.is_none() && location.is_none() {
            return Err(IngestError::MissingIdentifier(
                "inventory record has no id/containerId/container/partNumber/locationId".to_string(),
            ));
        }
        Ok(format!(
            "{}-{}",
            part.map(stringify).unwrap_or_default(),
            location.map(stringify).unwrap_or_default()
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
        map.entry("pcn").or_insert_with(|| Value::String(self.pcn.clone()));
        map.entry("facility").or_insert_with(|| Value::String(self.facility.clone()));
        Ok(Value::Object(map))
    }

    fn extractor_metadata(&self, fetched: usize, written: usize, now: DateTime<Utc>) -> Option<MetadataNode> {
        let _ = (fetched, written);
        Some(MetadataNode {
            external_id: format!("inventory-{}", now.timestamp()),
            extracted_data: Map::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn extractor() -> InventoryExtractor {
        InventoryExtractor::new(PlexHttpClient::new("https://example.com", "key", "cust"), 7, "CUST1", "PLANT-A")
    }

    #[test]
    fn row_key_falls_back_to_part_and_location_composite() {
        let e = extractor();
        assert_eq!(e.record_key(&json!({"id": "C1"})).unwrap(), "C1");
        assert_eq!(
            e.record_key(&json!({"partNumber": "P1", "locationId": "L1"})).unwrap(),
            "P1-L1"
        );
        assert!(e.record_key(&json!({})).is_err());
    }
}
