// Copyright (c) Plex Ingestion Engineers
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use plex_ingestion_core::timestamp::try_parse_timestamp;
use plex_ingestion_core::{Extractor, IngestError, MetadataNode, PlexDataSourceClient};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::warn;

/// One entry in the fixed DataSource catalog this extractor pulls from,
/// mirroring the source extractor's `definitions` list verbatim.
struct DataSourceDefinition {
    id: i64,
    name: &'static str,
    record_type: &'static str,
}

const CONTROL_PLAN_KEY_DISCOVERY_ID: i64 = 17981;

const DEFINITIONS: &[DataSourceDefinition] = &[
    DataSourceDefinition { id: 2199, name: "Checklist_Overview_Get", record_type: "checklist_overview" },
    DataSourceDefinition { id: 17473, name: "Checksheet_Data_By_Containers_Get", record_type: "checksheet_data_by_containers" },
    DataSourceDefinition { id: 81, name: "Checksheet_Get_Single", record_type: "checksheet_single" },
    DataSourceDefinition { id: 30949, name: "Checksheet_History_Crosstab_Get", record_type: "checksheet_history" },
    DataSourceDefinition { id: 2998, name: "Checksheet_Types_Get", record_type: "checksheet_types" },
    DataSourceDefinition { id: 21773, name: "Checksheet_With_Measurements_Web_Service_Add", record_type: "checksheet_measurements" },
    DataSourceDefinition { id: 4142, name: "Checksheets_Get", record_type: "checksheets" },
    DataSourceDefinition { id: 18718, name: "Checksheets_With_Job_Get", record_type: "checksheets_with_job" },
    DataSourceDefinition { id: 7262, name: "Control_Plan_Get", record_type: "control_plan" },
    DataSourceDefinition { id: 6456, name: "Defect_Type_Get", record_type: "defect_type" },
    DataSourceDefinition { id: 19938, name: "Problem_Logs_Get", record_type: "problem_logs" },
    DataSourceDefinition { id: 2158, name: "Sample_Plans_Get", record_type: "sample_plans" },
    DataSourceDefinition { id: 15387, name: "Spec_Doc_Get", record_type: "spec_doc" },
    DataSourceDefinition { id: 5112, name: "Specification_Picker_Get", record_type: "specification_picker" },
];

pub struct QualityExtractor {
    datasource: PlexDataSourceClient,
    batch_size: i64,
    pcn: String,
    facility: String,
    lookback_days: i64,
    start_date: Option<DateTime<Utc>>,
    control_plan_keys: Mutex<Option<Vec<i64>>>,
}

impl QualityExtractor {
    pub fn new(
        datasource: PlexDataSourceClient,
        batch_size: i64,
        pcn: impl Into<String>,
        facility: impl Into<String>,
        lookback_days: i64,
        start_date: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            datasource,
            batch_size,
            pcn: pcn.into(),
            facility: facility.into(),
            lookback_days,
            start_date,
            control_plan_keys: Mutex::new(None),
        }
    }

    /// `start_date` wins when configured; otherwise fall back to
    /// `lookback_days` before now, matching the source extractor's
    /// `_default_since`.
    fn default_since(&self) -> DateTime<Utc> {
        self.start_date.unwrap_or_else(|| Utc::now() - chrono::Duration::days(self.lookback_days))
    }

    fn build_inputs(definition: &DataSourceDefinition, control_plan_keys: &[i64]) -> Vec<Value> {
        match definition.id {
            17473 => vec![serde_json::json!({"Containers": "", "Specification_Key": 0})],
            81 => vec![serde_json::json!({"Checksheet_No": -1})],
            2199 => vec![serde_json::json!({"Checklist_No": -1})],
            7262 => {
                if control_plan_keys.is_empty() {
                    warn!("no control plan keys discovered; skipping Control_Plan_Get");
                    Vec::new()
                } else {
                    control_plan_keys
                        .iter()
                        .map(|key| serde_json::json!({"Control_Plan_Key": key}))
                        .collect()
                }
            }
            _ => vec![serde_json::json!({})],
        }
    }

    async fn ensure_control_plan_keys(&self) {
        {
            let cached = self.control_plan_keys.lock().await;
            if cached.is_some() {
                return;
            }
        }
        let response = self
            .datasource
            .execute(CONTROL_PLAN_KEY_DISCOVERY_ID, serde_json::json!({"RowLimit": self.batch_size}))
            .await;
        let keys = match response {
            Ok(response) => extract_control_plan_keys(&response),
            Err(err) => {
                warn!(error = %err, "failed to collect control plan keys");
                Vec::new()
            }
        };
        *self.control_plan_keys.lock().await = Some(keys);
    }

    fn normalize_response(
        definition: &DataSourceDefinition,
        response: &Value,
        inputs: &Value,
        since: DateTime<Utc>,
    ) -> Vec<Value> {
        let transaction = response
            .get("transactionNo")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or("no_transaction")
            .to_string();
        let row_limited = response.get("rowLimitedExceeded").cloned().unwrap_or(Value::Null);
        let timestamp = Utc::now();

        let tables = response.get("tables").and_then(Value::as_array);
        let mut records = Vec::new();

        match tables {
            Some(tables) if !tables.is_empty() => {
                for (table_idx, table) in tables.iter().enumerate() {
                    let columns: Vec<String> = table
                        .get("columns")
                        .and_then(Value::as_array)
                        .map(|cols| cols.iter().filter_map(|c| c.as_str().map(String::from)).collect())
                        .unwrap_or_default();
                    let rows = table.get("rows").and_then(Value::as_array).cloned().unwrap_or_default();

                    for (row_idx, row) in rows.iter().enumerate() {
                        let row_values = row.as_array().cloned().unwrap_or_default();
                        let mut row_dict = Map::new();
                        for (idx, column) in columns.iter().enumerate() {
                            row_dict.insert(column.clone(), row_values.get(idx).cloned().unwrap_or(Value::Null));
                        }

                        if !row_within_window(&row_dict, since) {
                            continue;
                        }

                        let key = make_row_key(definition.record_type, definition.id, &transaction, table_idx as i64, row_idx as i64);
                        let mut record = Map::new();
                        record.insert("rawKey".to_string(), Value::String(key));
                        record.insert("recordType".to_string(), Value::String(definition.record_type.to_string()));
                        record.insert("dataSourceId".to_string(), Value::from(definition.id));
                        record.insert("dataSourceName".to_string(), Value::String(definition.name.to_string()));
                        record.insert("tableIndex".to_string(), Value::from(table_idx as i64));
                        record.insert("rowIndex".to_string(), Value::from(row_idx as i64));
                        record.insert("transactionNo".to_string(), Value::String(transaction.clone()));
                        record.insert("rowLimitedExceeded".to_string(), row_limited.clone());
                        record.insert("inputs".to_string(), inputs.clone());
                        record.insert("timestamp".to_string(), Value::String(timestamp.to_rfc3339()));
                        for (k, v) in row_dict {
                            record.insert(k, v);
                        }
                        records.push(Value::Object(record));
                    }
                }
            }
            _ => {
                let payload = response
                    .get("outputs")
                    .cloned()
                    .or_else(|| response.get("raw").cloned())
                    .or_else(|| {
                        if response.as_object().map(|m| !m.is_empty()).unwrap_or(false) {
                            Some(response.clone())
                        } else {
                            None
                        }
                    });

                let key = make_row_key(definition.record_type, definition.id, &transaction, -1, 0);
                let mut record = Map::new();
                record.insert("rawKey".to_string(), Value::String(key));
                record.insert("recordType".to_string(), Value::String(definition.record_type.to_string()));
                record.insert("dataSourceId".to_string(), Value::from(definition.id));
                record.insert("dataSourceName".to_string(), Value::String(definition.name.to_string()));
                record.insert("tableIndex".to_string(), Value::from(-1));
                record.insert("rowIndex".to_string(), Value::from(0));
                record.insert("transactionNo".to_string(), Value::String(transaction.clone()));
                record.insert("rowLimitedExceeded".to_string(), row_limited);
                record.insert("inputs".to_string(), inputs.clone());
                record.insert("timestamp".to_string(), Value::String(timestamp.to_rfc3339()));
                match payload {
                    Some(Value::Object(obj)) => {
                        for (k, v) in obj {
                            record.insert(k, v);
                        }
                    }
                    Some(other) => {
                        record.insert("rawPayload".to_string(), other);
                    }
                    None => {}
                }
                records.push(Value::Object(record));
            }
        }
        records
    }
}

fn make_row_key(record_type: &str, datasource_id: i64, transaction: &str, table_idx: i64, row_idx: i64) -> String {
    let safe_tx = if transaction.is_empty() { "no_transaction".to_string() } else { transaction.replace(':', "-") };
    format!("{record_type}:{datasource_id}:{safe_tx}:{table_idx}:{row_idx}")
}

fn row_within_window(row: &Map<String, Value>, since: DateTime<Utc>) -> bool {
    let mut saw_datetime_field = false;
    for (key, value) in row {
        let Value::String(s) = value else { continue };
        let lowered = key.to_lowercase();
        if lowered.contains("date") || lowered.contains("time") {
            if let Some(parsed) = try_parse_timestamp(&Value::String(s.clone())) {
                saw_datetime_field = true;
                if parsed >= since {
                    return true;
                }
            }
        }
    }
    !saw_datetime_field
}

fn extract_control_plan_keys(response: &Value) -> Vec<i64> {
    let mut keys: Vec<i64> = response
        .get("tables")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .flat_map(|table| {
            let columns: Vec<String> = table
                .get("columns")
                .and_then(Value::as_array)
                .map(|cols| cols.iter().filter_map(|c| c.as_str().map(String::from)).collect())
                .unwrap_or_default();
            table
                .get("rows")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .filter_map(move |row| {
                    let values = row.as_array().cloned().unwrap_or_default();
                    let idx = columns.iter().position(|c| c == "Control_Plan_Key")?;
                    values.get(idx)?.as_i64()
                })
                .collect::<Vec<_>>()
        })
        .collect();
    keys.sort_unstable();
    keys.dedup();
    keys
}

#[async_trait]
impl Extractor for QualityExtractor {
    fn name(&self) -> &str {
        "quality"
    }

    fn raw_table_name(&self) -> &str {
        "quality_records"
    }

    async fn fetch_records(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Value>, IngestError> {
        let effective_since = since.unwrap_or_else(|| self.default_since());
        let mut records = Vec::new();

        for definition in DEFINITIONS {
            if definition.id == 7262 {
                self.ensure_control_plan_keys().await;
            }
            let control_plan_keys = self.control_plan_keys.lock().await.clone().unwrap_or_default();
            let input_sets = Self::build_inputs(definition, &control_plan_keys);
            for inputs in input_sets {
                match self.datasource.execute(definition.id, inputs.clone()).await {
                    Ok(response) => {
                        records.extend(Self::normalize_response(definition, &response, &inputs, effective_since));
                    }
                    Err(err) => {
                        warn!(datasource_id = definition.id, datasource_name = definition.name, error = %err, "data source request failed, skipping");
                    }
                }
            }
        }
        Ok(records)
    }

    fn record_key(&self, record: &Value) -> Result<String, IngestError> {
        record
            .get("rawKey")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| IngestError::MissingIdentifier("quality record missing rawKey".to_string()))
    }

    fn transform_record(&self, record: Value) -> Result<Value, IngestError> {
        let mut map = match record {
            Value::Object(m) => m,
            other => {
                let mut m = Map::new();
                m.insert("value".to_string(), other);
                m
            }
        };
        map.entry("pcn").or_insert_with(|| Value::String(self.pcn.clone()));
        map.entry("facility").or_insert_with(|| Value::String(self.facility.clone()));
        Ok(Value::Object(map))
    }

    fn extractor_metadata(&self, fetched: usize, written: usize, now: DateTime<Utc>) -> Option<MetadataNode> {
        let _ = (fetched, written);
        Some(MetadataNode {
            external_id: format!("quality-{}", now.timestamp()),
            extracted_data: Map::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn row_key_replaces_colons_in_transaction_no() {
        let key = make_row_key("checksheets", 4142, "T:9", 0, 1);
        assert_eq!(key, "checksheets:4142:T-9:0:1");
    }

    #[test]
    fn tables_response_produces_one_record_per_row() {
        let response = json!({
            "transactionNo": "T-9",
            "tables": [{"columns": ["A", "B"], "rows": [[1, "x"], [2, "y"]]}]
        });
        let definition = &DEFINITIONS[6];
        assert_eq!(definition.id, 4142);
        let records = QualityExtractor::normalize_response(definition, &response, &json!({}), Utc::now() - chrono::Duration::days(1));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["rawKey"], json!("checksheets:4142:T-9:0:0"));
        assert_eq!(records[1]["rawKey"], json!("checksheets:4142:T-9:0:1"));
        assert_eq!(records[0]["A"], json!(1));
        assert_eq!(records[0]["B"], json!("x"));
    }

    #[test]
    fn no_tables_response_produces_synthetic_record() {
        let response = json!({"outputs": {"foo": "bar"}});
        let definition = &DEFINITIONS[0];
        let records = QualityExtractor::normalize_response(definition, &response, &json!({}), Utc::now());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["tableIndex"], json!(-1));
        assert_eq!(records[0]["foo"], json!("bar"));
    }

    #[test]
    fn extract_control_plan_keys_dedupes_and_sorts() {
        let response = json!({
            "tables": [{"columns": ["Control_Plan_Key"], "rows": [[3], [1], [3]]}]
        });
        assert_eq!(extract_control_plan_keys(&response), vec![1, 3]);
    }
}
