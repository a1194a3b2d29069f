// Copyright (c) Plex Ingestion Engineers
// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::info;

use crate::canonical::Row;
use crate::error::IngestError;

/// The downstream operations the ingestion engine invokes. The full data
/// platform SDK (asset/event/timeseries APIs, data-modeling bootstrap) is an
/// external collaborator outside this crate's scope; this trait
/// specifies exactly the raw-table operations the extraction engine needs.
#[async_trait]
pub trait RawSinkClient: Send + Sync {
    /// Idempotent: a 409/400 "already exists" response is success.
    async fn ensure_database(&self, database: &str) -> Result<(), IngestError>;
    /// Idempotent: a 409/400 "already exists" response is success.
    async fn ensure_table(&self, database: &str, table: &str) -> Result<(), IngestError>;
    /// Upsert by row key, batched into chunks of the configured batch size.
    /// Returns the total number of rows written.
    async fn insert_rows(&self, database: &str, table: &str, rows: &[Row]) -> Result<usize, IngestError>;
    /// Best-effort auxiliary metadata write; callers are responsible for
    /// disabling this permanently for the process after the first failure
    /// (see [`crate::extractor::run_cycle`]).
    async fn upsert_extractor_metadata(&self, space: &str, nodes: &[MetadataNode]) -> Result<(), IngestError>;
}

/// One auxiliary "extraction ran" node, mirroring
/// `CogniteExtractorDataApply` in the source extractor's
/// `_upsert_extractor_metadata`.
#[derive(Clone, Debug)]
pub struct MetadataNode {
    pub external_id: String,
    pub extracted_data: Map<String, Value>,
}

/// Thin REST client against the downstream platform's raw-table surface.
/// Acquires a bearer token via the OAuth2 client-credentials grant on first
/// use and refreshes it shortly before expiry.
pub struct HttpRawSinkClient {
    client: reqwest::Client,
    host: String,
    project: String,
    token: TokenCache,
    batch_size: usize,
    ensured_databases: Mutex<HashSet<String>>,
    ensured_tables: Mutex<HashSet<String>>,
}

impl HttpRawSinkClient {
    pub fn new(
        host: impl Into<String>,
        project: impl Into<String>,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        batch_size: usize,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            host: host.into().trim_end_matches('/').to_string(),
            project: project.into(),
            token: TokenCache::new(token_url.into(), client_id.into(), client_secret.into()),
            batch_size: batch_size.max(1),
            ensured_databases: Mutex::new(HashSet::new()),
            ensured_tables: Mutex::new(HashSet::new()),
        }
    }

    fn raw_base(&self) -> String {
        format!("{}/api/v1/projects/{}/raw/dbs", self.host, self.project)
    }
}

#[async_trait]
impl RawSinkClient for HttpRawSinkClient {
    async fn ensure_database(&self, database: &str) -> Result<(), IngestError> {
        {
            let seen = self.ensured_databases.lock().await;
            if seen.contains(database) {
                return Ok(());
            }
        }
        let token = self.token.get(&self.client).await?;
        let url = self.raw_base();
        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(&serde_json::json!({ "items": [{ "name": database }] }))
            .send()
            .await?;
        accept_exists_conflict(response).await?;
        self.ensured_databases.lock().await.insert(database.to_string());
        info!(database, "ensured raw database");
        Ok(())
    }

    async fn ensure_table(&self, database: &str, table: &str) -> Result<(), IngestError> {
        let table_key = format!("{database}:{table}");
        {
            let seen = self.ensured_tables.lock().await;
            if seen.contains(&table_key) {
                return Ok(());
            }
        }
        let token = self.token.get(&self.client).await?;
        let url = format!("{}/{}/tables", self.raw_base(), database);
        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(&serde_json::json!({ "items": [{ "name": table }] }))
            .send()
            .await?;
        accept_exists_conflict(response).await?;
        self.ensured_tables.lock().await.insert(table_key);
        info!(database, table, "ensured raw table");
        Ok(())
    }

    async fn insert_rows(&self, database: &str, table: &str, rows: &[Row]) -> Result<usize, IngestError> {
        let token = self.token.get(&self.client).await?;
        let url = format!("{}/{}/tables/{}/rows", self.raw_base(), database, table);
        let mut total = 0usize;
        for chunk in rows.chunks(self.batch_size) {
            let items: Vec<Value> = chunk
                .iter()
                .map(|(key, columns)| serde_json::json!({ "key": key, "columns": columns }))
                .collect();
            let response = self
                .client
                .post(&url)
                .bearer_auth(&token)
                .json(&serde_json::json!({ "items": items }))
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(IngestError::Upstream {
                    status: status.as_u16(),
                    body,
                });
            }
            total += chunk.len();
        }
        Ok(total)
    }

    async fn upsert_extractor_metadata(&self, space: &str, nodes: &[MetadataNode]) -> Result<(), IngestError> {
        if nodes.is_empty() {
            return Ok(());
        }
        let token = self.token.get(&self.client).await?;
        let url = format!("{}/api/v1/projects/{}/models/instances", self.host, self.project);
        let items: Vec<Value> = nodes
            .iter()
            .map(|n| {
                serde_json::json!({
                    "space": space,
                    "externalId": n.external_id,
                    "properties": n.extracted_data,
                })
            })
            .collect();
        for chunk in items.chunks(500) {
            let response = self
                .client
                .post(&url)
                .bearer_auth(&token)
                .json(&serde_json::json!({ "items": chunk }))
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(IngestError::Upstream {
                    status: status.as_u16(),
                    body,
                });
            }
        }
        Ok(())
    }
}

async fn accept_exists_conflict(response: reqwest::Response) -> Result<(), IngestError> {
    let status = response.status();
    if status.is_success() || status == StatusCode::CONFLICT || status == StatusCode::BAD_REQUEST {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(IngestError::Upstream {
        status: status.as_u16(),
        body,
    })
}

struct TokenCache {
    token_url: String,
    client_id: String,
    client_secret: String,
    cached: Mutex<Option<(String, Instant)>>,
}

impl TokenCache {
    fn new(token_url: String, client_id: String, client_secret: String) -> Self {
        Self {
            token_url,
            client_id,
            client_secret,
            cached: Mutex::new(None),
        }
    }

    async fn get(&self, client: &reqwest::Client) -> Result<String, IngestError> {
        let mut cached = self.cached.lock().await;
        if let Some((token, expires_at)) = cached.as_ref() {
            if Instant::now() < *expires_at {
                return Ok(token.clone());
            }
        }
        let response = client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(IngestError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        let payload: Value = response.json().await?;
        let token = payload["access_token"]
            .as_str()
            .ok_or_else(|| IngestError::Upstream {
                status: 0,
                body: "token response missing access_token".to_string(),
            })?
            .to_string();
        let expires_in = payload["expires_in"].as_u64().unwrap_or(3600);
        let expires_at = Instant::now() + Duration::from_secs(expires_in.saturating_sub(30));
        *cached = Some((token.clone(), expires_at));
        Ok(token)
    }
}

/// In-memory sink for tests and dry-run use, backed by a shared map so it
/// can be cloned cheaply and inspected after a cycle.
#[derive(Clone, Default)]
pub struct MockRawSinkClient {
    inner: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    databases: HashSet<String>,
    tables: HashSet<(String, String)>,
    rows: HashMap<(String, String), HashMap<String, Map<String, Value>>>,
    metadata: Vec<MetadataNode>,
    fail_metadata: bool,
}

impl MockRawSinkClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next [`RawSinkClient::upsert_extractor_metadata`] call fail,
    /// to exercise the "disable after first failure" behavior.
    pub async fn fail_next_metadata_write(&self) {
        self.inner.lock().await.fail_metadata = true;
    }

    pub async fn rows(&self, database: &str, table: &str) -> HashMap<String, Map<String, Value>> {
        self.inner
            .lock()
            .await
            .rows
            .get(&(database.to_string(), table.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn metadata_nodes(&self) -> Vec<MetadataNode> {
        self.inner.lock().await.metadata.clone()
    }
}

#[async_trait]
impl RawSinkClient for MockRawSinkClient {
    async fn ensure_database(&self, database: &str) -> Result<(), IngestError> {
        self.inner.lock().await.databases.insert(database.to_string());
        Ok(())
    }

    async fn ensure_table(&self, database: &str, table: &str) -> Result<(), IngestError> {
        self.inner
            .lock()
            .await
            .tables
            .insert((database.to_string(), table.to_string()));
        Ok(())
    }

    async fn insert_rows(&self, database: &str, table: &str, rows: &[Row]) -> Result<usize, IngestError> {
        let mut state = self.inner.lock().await;
        let table_rows = state
            .rows
            .entry((database.to_string(), table.to_string()))
            .or_default();
        for (key, columns) in rows {
            table_rows.insert(key.clone(), columns.clone());
        }
        Ok(rows.len())
    }

    async fn upsert_extractor_metadata(&self, _space: &str, nodes: &[MetadataNode]) -> Result<(), IngestError> {
        let mut state = self.inner.lock().await;
        if state.fail_metadata {
            state.fail_metadata = false;
            return Err(IngestError::Upstream {
                status: 500,
                body: "simulated metadata failure".to_string(),
            });
        }
        state.metadata.extend_from_slice(nodes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_sink_upserts_by_key() {
        let sink = MockRawSinkClient::new();
        let mut cols = Map::new();
        cols.insert("id".to_string(), Value::String("J1".to_string()));
        sink.insert_rows("plex_raw", "jobs", &[("J1".to_string(), cols.clone())])
            .await
            .unwrap();
        cols.insert("status".to_string(), Value::String("updated".to_string()));
        sink.insert_rows("plex_raw", "jobs", &[("J1".to_string(), cols.clone())])
            .await
            .unwrap();

        let rows = sink.rows("plex_raw", "jobs").await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows["J1"]["status"], Value::String("updated".to_string()));
    }
}
