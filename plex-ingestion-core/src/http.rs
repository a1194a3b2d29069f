// Copyright (c) Plex Ingestion Engineers
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Value;
use tracing::warn;
use url::Url;

use crate::error::IngestError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Authenticated GET client against the vendor MES REST API, with linear
/// retry/backoff and offset-based pagination.
///
/// Stateless beyond the pooled connections `reqwest::Client` keeps
/// internally, so a single instance can be cloned cheaply and handed to
/// every extractor.
#[derive(Clone)]
pub struct PlexHttpClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    customer_id: String,
    max_retries: u32,
    retry_base_delay: Duration,
}

impl PlexHttpClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, customer_id: impl Into<String>) -> Self {
        Self::with_retry(base_url, api_key, customer_id, 3, Duration::from_secs(5))
    }

    pub fn with_retry(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        customer_id: impl Into<String>,
        max_retries: u32,
        retry_base_delay: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .expect("reqwest client build is infallible for this configuration");
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            customer_id: customer_id.into(),
            max_retries: max_retries.max(1),
            retry_base_delay,
        }
    }

    /// Joins `path` onto the configured base URL. `path` is expected to be
    /// root-relative (e.g. `/scheduling/v1/jobs`), so `Url::join` replaces
    /// the base's path entirely rather than appending to it.
    fn build_url(&self, path: &str) -> Result<Url, IngestError> {
        let base = Url::parse(&self.base_url).map_err(|e| IngestError::Configuration(format!("invalid base URL: {e}")))?;
        base.join(path).map_err(|e| IngestError::Configuration(format!("invalid request path {path}: {e}")))
    }

    /// A single authenticated GET, retried on transport failures and on
    /// retriable HTTP statuses (429, 5xx) with linear backoff
    /// `retry_base_delay * attempt`. Other HTTP statuses >= 400 fail
    /// immediately as [`IngestError::Upstream`] without retry — the caller
    /// decides whether that failure is fatal for the cycle.
    pub async fn get(&self, path: &str, query: &BTreeMap<String, String>) -> Result<Value, IngestError> {
        let url = self.build_url(path)?;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let request = self
                .client
                .get(url.clone())
                .header("X-Plex-Connect-Api-Key", &self.api_key)
                .header("X-Plex-Connect-Customer-Id", &self.customer_id)
                .header("Content-Type", "application/json")
                .query(query);

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response.json::<Value>().await.map_err(IngestError::from);
                    }

                    let retry_after = retry_after_secs(&response);
                    let body = response.text().await.unwrap_or_default();

                    if is_retriable_status(status) && attempt < self.max_retries {
                        let delay = retry_after.unwrap_or_else(|| self.retry_base_delay * attempt);
                        warn!(%status, attempt, "plex http request failed, retrying");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(IngestError::Upstream {
                        status: status.as_u16(),
                        body,
                    });
                }
                Err(err) => {
                    if attempt >= self.max_retries {
                        return Err(IngestError::Transient(err.to_string()));
                    }
                    warn!(error = %err, attempt, "plex http request failed, retrying");
                    tokio::time::sleep(self.retry_base_delay * attempt).await;
                }
            }
        }
    }

    /// Paginate an endpoint by incrementing an `offset`-style query
    /// parameter until the server returns fewer items than `page_size`, or
    /// an empty page.
    pub async fn paginate(
        &self,
        path: &str,
        query: &BTreeMap<String, String>,
        data_key: Option<&str>,
        page_param: &str,
        page_size: usize,
    ) -> Result<Vec<Value>, IngestError> {
        let mut collected = Vec::new();
        let mut offset = 0usize;
        loop {
            let mut params = query.clone();
            params.insert(page_param.to_string(), offset.to_string());

            let body = self.get(path, &params).await?;
            let items = extract_page(&body, data_key);
            let page_len = items.len();
            if page_len == 0 {
                break;
            }
            collected.extend(items);
            if page_len < page_size {
                break;
            }
            offset += page_len;
        }
        Ok(collected)
    }
}

fn extract_page(body: &Value, data_key: Option<&str>) -> Vec<Value> {
    match body {
        Value::Object(map) => {
            let key = data_key.unwrap_or("items");
            match map.get(key) {
                Some(Value::Array(items)) => items.clone(),
                _ => Vec::new(),
            }
        }
        Value::Array(items) => items.clone(),
        _ => Vec::new(),
    }
}

fn is_retriable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn retry_after_secs(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, max_retries: u32) -> PlexHttpClient {
        PlexHttpClient::with_retry(server.uri(), "key", "cust", max_retries, Duration::from_millis(5))
    }

    #[tokio::test]
    async fn paginate_stops_on_short_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .and(query_param("offset", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"id": "a"}, {"id": "b"}]
            })))
            .mount(&server)
            .await;

        let c = client(&server, 3);
        let rows = c
            .paginate("/items", &BTreeMap::new(), Some("data"), "offset", 1000)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn paginate_issues_ceil_n_over_p_requests() {
        let server = MockServer::start().await;
        // page size 2, 5 total items -> pages of 2,2,1 -> 3 requests.
        Mock::given(method("GET"))
            .and(path("/items"))
            .and(query_param("offset", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"id": "1"}, {"id": "2"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .and(query_param("offset", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"id": "3"}, {"id": "4"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .and(query_param("offset", "4"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"id": "5"}]
            })))
            .mount(&server)
            .await;

        let c = client(&server, 3);
        let rows = c
            .paginate("/items", &BTreeMap::new(), Some("data"), "offset", 2)
            .await
            .unwrap();
        assert_eq!(rows.len(), 5);
    }

    #[tokio::test]
    async fn paginate_issues_single_request_when_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "data": [] })))
            .mount(&server)
            .await;

        let c = client(&server, 3);
        let rows = c
            .paginate("/items", &BTreeMap::new(), Some("data"), "offset", 1000)
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn retries_transient_5xx_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
            .mount(&server)
            .await;

        let c = client(&server, 3);
        let result = c.get("/flaky", &BTreeMap::new()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn exhausts_retry_budget_on_persistent_5xx() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/always-down"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let c = client(&server, 3);
        let result = c.get("/always-down", &BTreeMap::new()).await;
        match result {
            Err(IngestError::Upstream { status, .. }) => assert_eq!(status, 503),
            other => panic!("expected Upstream error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_retriable_4xx_fails_immediately() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/forbidden"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let c = client(&server, 3);
        let result = c.get("/forbidden", &BTreeMap::new()).await;
        assert!(matches!(result, Err(IngestError::Upstream { status: 403, .. })));
    }
}
