// Copyright (c) Plex Ingestion Engineers
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::canonical::{canonicalize, Row};
use crate::error::IngestError;
use crate::sink::{MetadataNode, RawSinkClient};
use crate::timestamp::try_parse_timestamp;
use crate::watermark::WatermarkStore;

/// Fields checked, in order, when resolving a record's own "last updated"
/// instant for the next watermark. Mirrors the fallback chain the source
/// extractors use across the five domains (`lastUpdated`, `updated_at`,
/// `updatedAt`, `timestamp`).
const UPDATED_AT_FIELDS: &[&str] = &["lastUpdated", "updated_at", "updatedAt", "timestamp"];

/// Domain-specific behavior plugged into [`run_cycle`]. Each of the six
/// concrete extractors (jobs, production, inventory, performance, quality,
/// master data) implements this once; the cycle algorithm itself never
/// varies between them.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Stable name used for the watermark file and log scoping, e.g. `"jobs"`.
    fn name(&self) -> &str;

    /// The raw table this extractor's records land in.
    fn raw_table_name(&self) -> &str;

    /// Fetch every record updated since `since` (`None` means "first run,
    /// use the extractor's configured lookback window").
    async fn fetch_records(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Value>, IngestError>;

    /// Derive this record's deterministic row key from its natural-key
    /// fallback chain. `Err(MissingIdentifier)` causes the record to be
    /// dropped from the batch rather than aborting the cycle.
    fn record_key(&self, record: &Value) -> Result<String, IngestError>;

    /// Domain-specific reshaping prior to canonicalization. Default is the
    /// identity transform.
    fn transform_record(&self, record: Value) -> Result<Value, IngestError> {
        Ok(record)
    }

    /// Auxiliary "extraction ran" metadata node for this cycle, or `None` if
    /// the extractor does not participate in metadata reporting.
    fn extractor_metadata(&self, fetched: usize, written: usize, now: DateTime<Utc>) -> Option<MetadataNode> {
        let _ = (fetched, written, now);
        None
    }
}

/// Outcome of one [`run_cycle`] invocation, surfaced for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    pub dropped_missing_identifier: usize,
    pub written: usize,
    pub watermark_advanced: bool,
}

/// Process-wide latch: once an extractor-metadata write fails, every
/// subsequent cycle (of any extractor, for the process lifetime) skips that
/// write rather than retrying it.
static METADATA_WRITES_DISABLED: AtomicBool = AtomicBool::new(false);

/// Runs one authoritative extraction cycle for `extractor` against `sink`,
/// persisting progress to `watermark`. Implements the ten-step algorithm:
/// read watermark, fetch, short-circuit on empty, transform, key + drop
/// unkeyable records, canonicalize, ensure database/table, insert, resolve
/// and persist the new watermark, and (best-effort) report metadata.
pub async fn run_cycle(
    extractor: &dyn Extractor,
    sink: &(dyn RawSinkClient),
    watermark: &mut WatermarkStore,
    database: &str,
    metadata_space: &str,
) -> Result<CycleReport, IngestError> {
    let name = extractor.name();
    let since = watermark.get();

    let records = extractor.fetch_records(since).await?;
    let fetched = records.len();
    if records.is_empty() {
        info!(extractor = name, "no new records, cycle skipped");
        return Ok(CycleReport {
            fetched: 0,
            dropped_missing_identifier: 0,
            written: 0,
            watermark_advanced: false,
        });
    }

    let mut rows: Vec<Row> = Vec::with_capacity(records.len());
    let mut dropped = 0usize;
    let mut newest_update: Option<DateTime<Utc>> = None;

    for record in records {
        let transformed = match extractor.transform_record(record) {
            Ok(v) => v,
            Err(err) => {
                warn!(extractor = name, error = %err, "dropping record that failed transform");
                dropped += 1;
                continue;
            }
        };

        let key = match extractor.record_key(&transformed) {
            Ok(k) => k,
            Err(err) => {
                warn!(extractor = name, error = %err, "dropping record with no usable identifier");
                dropped += 1;
                continue;
            }
        };

        if let Some(candidate) = latest_updated_at(&transformed) {
            newest_update = Some(match newest_update {
                Some(current) if current >= candidate => current,
                _ => candidate,
            });
        }

        let object = match transformed {
            Value::Object(map) => map,
            other => {
                let mut wrapped = Map::new();
                wrapped.insert("value".to_string(), other);
                wrapped
            }
        };
        rows.push((key, canonicalize(&object)));
    }

    if rows.is_empty() {
        warn!(extractor = name, dropped, "every fetched record was dropped, watermark left unchanged");
        return Ok(CycleReport {
            fetched,
            dropped_missing_identifier: dropped,
            written: 0,
            watermark_advanced: false,
        });
    }

    sink.ensure_database(database).await?;
    sink.ensure_table(database, extractor.raw_table_name()).await?;
    let written = sink.insert_rows(database, extractor.raw_table_name(), &rows).await?;

    let new_watermark = newest_update.unwrap_or_else(Utc::now);
    watermark.set(new_watermark)?;
    info!(extractor = name, fetched, dropped, written, watermark = %new_watermark, "cycle complete");

    if !METADATA_WRITES_DISABLED.load(Ordering::Relaxed) {
        if let Some(node) = extractor.extractor_metadata(fetched, written, new_watermark) {
            if let Err(err) = sink.upsert_extractor_metadata(metadata_space, &[node]).await {
                warn!(extractor = name, error = %err, "extractor metadata write failed, disabling for process lifetime");
                METADATA_WRITES_DISABLED.store(true, Ordering::Relaxed);
            }
        }
    }

    Ok(CycleReport {
        fetched,
        dropped_missing_identifier: dropped,
        written,
        watermark_advanced: true,
    })
}

fn latest_updated_at(record: &Value) -> Option<DateTime<Utc>> {
    let object = record.as_object()?;
    UPDATED_AT_FIELDS
        .iter()
        .find_map(|field| object.get(*field))
        .and_then(try_parse_timestamp)
}

/// Reset the process-wide metadata-write latch. Test-only: production code
/// never needs to re-enable metadata writes once disabled.
#[cfg(test)]
pub(crate) fn reset_metadata_latch_for_test() {
    METADATA_WRITES_DISABLED.store(false, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MockRawSinkClient;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    struct FakeExtractor {
        table: String,
        batches: StdMutex<Vec<Vec<Value>>>,
    }

    #[async_trait]
    impl Extractor for FakeExtractor {
        fn name(&self) -> &str {
            "fake"
        }

        fn raw_table_name(&self) -> &str {
            &self.table
        }

        async fn fetch_records(&self, _since: Option<DateTime<Utc>>) -> Result<Vec<Value>, IngestError> {
            Ok(self.batches.lock().unwrap().pop().unwrap_or_default())
        }

        fn record_key(&self, record: &Value) -> Result<String, IngestError> {
            record["id"]
                .as_str()
                .map(|s| s.to_string())
                .ok_or_else(|| IngestError::MissingIdentifier("id".to_string()))
        }
    }

    fn fake(batches: Vec<Vec<Value>>) -> FakeExtractor {
        FakeExtractor {
            table: "fake_table".to_string(),
            batches: StdMutex::new(batches.into_iter().rev().collect()),
        }
    }

    #[tokio::test]
    async fn empty_fetch_skips_sink_and_watermark() {
        let dir = tempdir().unwrap();
        let mut wm = WatermarkStore::open(dir.path(), "fake").unwrap();
        let sink = MockRawSinkClient::new();
        let extractor = fake(vec![vec![]]);

        let report = run_cycle(&extractor, &sink, &mut wm, "plex_raw", "space")
            .await
            .unwrap();

        assert_eq!(report.fetched, 0);
        assert!(!report.watermark_advanced);
        assert!(wm.get().is_none());
    }

    #[tokio::test]
    async fn records_missing_identifier_are_dropped_but_others_still_write() {
        let dir = tempdir().unwrap();
        let mut wm = WatermarkStore::open(dir.path(), "fake").unwrap();
        let sink = MockRawSinkClient::new();
        let extractor = fake(vec![vec![
            json!({"id": "A", "lastUpdated": "2024-06-01T00:00:00Z"}),
            json!({"note": "no id here"}),
        ]]);

        let report = run_cycle(&extractor, &sink, &mut wm, "plex_raw", "space")
            .await
            .unwrap();

        assert_eq!(report.fetched, 2);
        assert_eq!(report.dropped_missing_identifier, 1);
        assert_eq!(report.written, 1);
        assert!(report.watermark_advanced);

        let rows = sink.rows("plex_raw", "fake_table").await;
        assert!(rows.contains_key("A"));
    }

    #[tokio::test]
    async fn watermark_advances_to_max_record_update_time() {
        let dir = tempdir().unwrap();
        let mut wm = WatermarkStore::open(dir.path(), "fake").unwrap();
        let sink = MockRawSinkClient::new();
        let extractor = fake(vec![vec![
            json!({"id": "A", "lastUpdated": "2024-06-01T00:00:00Z"}),
            json!({"id": "B", "lastUpdated": "2024-06-03T00:00:00Z"}),
        ]]);

        run_cycle(&extractor, &sink, &mut wm, "plex_raw", "space")
            .await
            .unwrap();

        let watermark = wm.get().unwrap();
        assert_eq!(watermark.to_rfc3339(), "2024-06-03T00:00:00+00:00");
    }

    #[tokio::test]
    async fn metadata_failure_disables_future_writes_for_process() {
        reset_metadata_latch_for_test();
        struct WithMetadata(FakeExtractor);

        #[async_trait]
        impl Extractor for WithMetadata {
            fn name(&self) -> &str {
                self.0.name()
            }
            fn raw_table_name(&self) -> &str {
                self.0.raw_table_name()
            }
            async fn fetch_records(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Value>, IngestError> {
                self.0.fetch_records(since).await
            }
            fn record_key(&self, record: &Value) -> Result<String, IngestError> {
                self.0.record_key(record)
            }
            fn extractor_metadata(&self, fetched: usize, written: usize, now: DateTime<Utc>) -> Option<MetadataNode> {
                let _ = (fetched, written, now);
                Some(MetadataNode {
                    external_id: "fake-run".to_string(),
                    extracted_data: Map::new(),
                })
            }
        }

        let dir = tempdir().unwrap();
        let sink = MockRawSinkClient::new();
        sink.fail_next_metadata_write().await;

        let extractor = WithMetadata(fake(vec![
            vec![json!({"id": "B", "lastUpdated": "2024-06-02T00:00:00Z"})],
            vec![json!({"id": "A", "lastUpdated": "2024-06-01T00:00:00Z"})],
        ]));

        let mut wm1 = WatermarkStore::open(dir.path(), "fake").unwrap();
        run_cycle(&extractor, &sink, &mut wm1, "plex_raw", "space")
            .await
            .unwrap();
        assert!(sink.metadata_nodes().await.is_empty());

        let mut wm2 = WatermarkStore::open(dir.path(), "fake").unwrap();
        run_cycle(&extractor, &sink, &mut wm2, "plex_raw", "space")
            .await
            .unwrap();
        assert!(
            sink.metadata_nodes().await.is_empty(),
            "metadata writes must stay disabled for the rest of the process after the first failure"
        );
    }
}
