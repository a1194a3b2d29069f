// Copyright (c) Plex Ingestion Engineers
// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IngestError;
use crate::timestamp::parse_timestamp_str;

const PROCESSED_IDS_RING_SIZE: usize = 10_000;

/// The persisted shape of one extractor's state file: `{extractorName:
/// {last_extraction_time, processed_{resource}_ids...}}`. Every extractor
/// owns its own file; the document is still nested under the
/// extractor's own name for shape-compatibility with a hypothetical shared
/// store keyed by extractor name.
#[derive(Serialize, Deserialize, Default, Clone, Debug)]
struct ExtractorState {
    last_extraction_time: Option<String>,
    #[serde(flatten)]
    processed_ids: HashMap<String, VecDeque<String>>,
}

/// Per-extractor, process-local persistent record of the last successful
/// extraction instant, plus an optional bounded ring of recently processed
/// natural keys per resource.
///
/// Opened once per extractor and held for the process lifetime; all
/// writes are atomic (write-to-temp then rename) so a crash mid-write never
/// corrupts the previously durable state.
pub struct WatermarkStore {
    path: PathBuf,
    extractor_name: String,
    state: ExtractorState,
}

impl WatermarkStore {
    pub fn open(state_directory: &Path, extractor_name: &str) -> Result<Self, IngestError> {
        fs::create_dir_all(state_directory)?;
        let path = state_directory.join(format!("{extractor_name}_raw_state.json"));
        let state = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            let doc: HashMap<String, ExtractorState> = serde_json::from_str(&contents)?;
            doc.get(extractor_name).cloned().unwrap_or_default()
        } else {
            ExtractorState::default()
        };
        Ok(Self {
            path,
            extractor_name: extractor_name.to_string(),
            state,
        })
    }

    /// The last successfully ingested instant, or `None` if this is the
    /// extractor's first run.
    pub fn get(&self) -> Option<DateTime<Utc>> {
        self.state
            .last_extraction_time
            .as_deref()
            .and_then(|s| parse_timestamp_str(s).ok())
    }

    /// Advance the watermark and persist immediately. Callers must ensure
    /// monotonicity; the store itself does not enforce it,
    /// matching the source `StateTracker.set_last_extraction_time`, which is
    /// an unconditional setter.
    pub fn set(&mut self, instant: DateTime<Utc>) -> Result<(), IngestError> {
        self.state.last_extraction_time = Some(instant.to_rfc3339());
        self.flush()
    }

    pub fn has_processed_id(&self, resource: &str, id: &str) -> bool {
        self.state
            .processed_ids
            .get(&Self::ring_key(resource))
            .map(|ring| ring.iter().any(|existing| existing == id))
            .unwrap_or(false)
    }

    /// Record `id` as processed for `resource`, trimming the ring to the
    /// most recent [`PROCESSED_IDS_RING_SIZE`] entries.
    pub fn add_processed_id(&mut self, resource: &str, id: &str) -> Result<(), IngestError> {
        let key = Self::ring_key(resource);
        let ring = self.state.processed_ids.entry(key).or_default();
        if ring.iter().any(|existing| existing == id) {
            return Ok(());
        }
        ring.push_back(id.to_string());
        while ring.len() > PROCESSED_IDS_RING_SIZE {
            ring.pop_front();
        }
        self.flush()
    }

    fn ring_key(resource: &str) -> String {
        format!("processed_{resource}_ids")
    }

    fn flush(&self) -> Result<(), IngestError> {
        let mut doc = HashMap::new();
        doc.insert(self.extractor_name.clone(), self.state.clone());
        let serialized = serde_json::to_string_pretty(&doc)?;

        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, serialized)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn absent_watermark_is_none_on_first_run() {
        let dir = tempdir().unwrap();
        let store = WatermarkStore::open(dir.path(), "jobs").unwrap();
        assert!(store.get().is_none());
    }

    #[test]
    fn set_then_reopen_round_trips() {
        let dir = tempdir().unwrap();
        let instant = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        {
            let mut store = WatermarkStore::open(dir.path(), "jobs").unwrap();
            store.set(instant).unwrap();
        }
        let reopened = WatermarkStore::open(dir.path(), "jobs").unwrap();
        assert_eq!(reopened.get().unwrap(), instant);
    }

    #[test]
    fn processed_ids_ring_is_bounded() {
        let dir = tempdir().unwrap();
        let mut store = WatermarkStore::open(dir.path(), "inventory").unwrap();
        for i in 0..(10_000 + 5) {
            store.add_processed_id("containers", &i.to_string()).unwrap();
        }
        assert!(!store.has_processed_id("containers", "0"));
        assert!(store.has_processed_id("containers", "10004"));
    }

    #[test]
    fn separate_extractors_do_not_share_state() {
        let dir = tempdir().unwrap();
        let instant = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut jobs_store = WatermarkStore::open(dir.path(), "jobs").unwrap();
        jobs_store.set(instant).unwrap();

        let production_store = WatermarkStore::open(dir.path(), "production").unwrap();
        assert!(production_store.get().is_none());
    }
}
