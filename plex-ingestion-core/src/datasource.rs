// Copyright (c) Plex Ingestion Engineers
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use crate::error::IngestError;

/// Client for the vendor's second API: predefined server-side queries
/// ("datasources") that return tabular result sets. Auth is HTTP Basic,
/// distinct from the primary HTTP client's header-based auth.
#[derive(Clone)]
pub struct PlexDataSourceClient {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    max_retries: u32,
    retry_base_delay: Duration,
}

impl PlexDataSourceClient {
    pub fn new(host: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::with_retry(host, username, password, 3, Duration::from_secs(5))
    }

    pub fn with_retry(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        max_retries: u32,
        retry_base_delay: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client build is infallible for this configuration"),
            base_url: host.into().trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
            max_retries: max_retries.max(1),
            retry_base_delay,
        }
    }

    /// Invoke `datasource_id` with `inputs`, retrying on any failure (network
    /// or HTTP status) with the same linear backoff as the HTTP client.
    /// A non-JSON response body is wrapped as `{"raw": <text>}`.
    pub async fn execute(&self, datasource_id: i64, inputs: Value) -> Result<Value, IngestError> {
        let url = format!("{}/api/datasources/{}/execute", self.base_url, datasource_id);
        let payload = serde_json::json!({ "inputs": inputs });

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let request = self
                .client
                .post(&url)
                .basic_auth(&self.username, Some(&self.password))
                .header("Accept", "application/json")
                .json(&payload);

            let outcome = async {
                let response = request.send().await?;
                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Ok::<_, reqwest::Error>(Err(IngestError::Upstream {
                        status: status.as_u16(),
                        body,
                    }));
                }
                let is_json = response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.contains("application/json"))
                    .unwrap_or(false);
                if is_json {
                    let value = response.json::<Value>().await?;
                    Ok(Ok(value))
                } else {
                    let text = response.text().await?;
                    Ok(Ok(serde_json::json!({ "raw": text })))
                }
            }
            .await;

            match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(upstream_err)) => {
                    if attempt >= self.max_retries {
                        return Err(upstream_err);
                    }
                    warn!(datasource_id, attempt, error = %upstream_err, "data source request failed, retrying");
                    tokio::time::sleep(self.retry_base_delay * attempt).await;
                }
                Err(transport_err) => {
                    if attempt >= self.max_retries {
                        return Err(IngestError::Transient(transport_err.to_string()));
                    }
                    warn!(datasource_id, attempt, error = %transport_err, "data source request failed, retrying");
                    tokio::time::sleep(self.retry_base_delay * attempt).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn wraps_non_json_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/datasources/42/execute"))
            .respond_with(ResponseTemplate::new(200).set_body_string("plain text").insert_header("content-type", "text/plain"))
            .mount(&server)
            .await;

        let client = PlexDataSourceClient::new(server.uri(), "user", "pass");
        let result = client.execute(42, serde_json::json!({})).await.unwrap();
        assert_eq!(result, serde_json::json!({ "raw": "plain text" }));
    }

    #[tokio::test]
    async fn returns_tables_shaped_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/datasources/4142/execute"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "transactionNo": "T-9",
                "tables": [{"columns": ["A", "B"], "rows": [[1, "x"], [2, "y"]]}]
            })))
            .mount(&server)
            .await;

        let client = PlexDataSourceClient::new(server.uri(), "user", "pass");
        let result = client.execute(4142, serde_json::json!({})).await.unwrap();
        assert_eq!(result["transactionNo"], "T-9");
    }

    #[tokio::test]
    async fn retries_on_failure_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/datasources/1/execute"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/datasources/1/execute"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"tables": []})))
            .mount(&server)
            .await;

        let client = PlexDataSourceClient::with_retry(server.uri(), "user", "pass", 3, Duration::from_millis(5));
        let result = client.execute(1, serde_json::json!({})).await;
        assert!(result.is_ok());
    }
}
