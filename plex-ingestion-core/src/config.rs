// Copyright (c) Plex Ingestion Engineers
// SPDX-License-Identifier: Apache-2.0

use std::env;

use crate::error::IngestError;

/// Per-domain lookback window, in days, used when an extractor has no prior watermark.
#[derive(Clone, Debug)]
pub struct LookbackConfig {
    pub jobs_days: i64,
    pub production_days: i64,
    pub inventory_days: i64,
    pub performance_days: i64,
    pub master_days: i64,
    pub quality_days: i64,
}

impl Default for LookbackConfig {
    fn default() -> Self {
        Self {
            jobs_days: 7,
            production_days: 3,
            inventory_days: 7,
            performance_days: 7,
            master_days: 30,
            quality_days: 30,
        }
    }
}

/// Settings shared across all extractors. Construct once via [`PlexIngestionConfig::from_env`]
/// and share by reference/clone; this mirrors `RawExtractorConfig` in the source extractor.
#[derive(Clone, Debug)]
pub struct PlexIngestionConfig {
    pub plex_api_key: String,
    pub plex_customer_id: String,
    pub plex_ds_host: Option<String>,
    pub plex_ds_username: Option<String>,
    pub plex_ds_password: Option<String>,
    pub cdf_host: String,
    pub cdf_project: String,
    pub cdf_client_id: String,
    pub cdf_client_secret: String,
    pub cdf_token_url: String,

    pub plex_base_url: String,
    pub raw_database: String,
    pub extractor_space: String,
    pub state_directory: String,
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub facility_name: String,

    pub lookback: LookbackConfig,
    pub quality_batch_size: usize,
    pub quality_extraction_start_date: Option<String>,
}

/// Reads every required/optional environment variable in one pass, collecting
/// all missing-required-variable names before failing (unlike the Python
/// original, which raises on the first missing variable).
impl PlexIngestionConfig {
    pub fn from_env() -> Result<Self, IngestError> {
        let mut missing = Vec::new();
        let mut require = |name: &str| -> String {
            match env::var(name) {
                Ok(v) if !v.is_empty() => v,
                _ => {
                    missing.push(name.to_string());
                    String::new()
                }
            }
        };

        let plex_api_key = require("PLEX_API_KEY");
        let plex_customer_id = require("PLEX_CUSTOMER_ID");
        let cdf_host = require("CDF_HOST");
        let cdf_project = require("CDF_PROJECT");
        let cdf_client_id = require("CDF_CLIENT_ID");
        let cdf_client_secret = require("CDF_CLIENT_SECRET");
        let cdf_token_url = require("CDF_TOKEN_URL");

        if !missing.is_empty() {
            return Err(IngestError::Configuration(format!(
                "missing required environment variable(s): {}",
                missing.join(", ")
            )));
        }

        let plex_ds_host = env::var("PLEX_DS_HOST")
            .ok()
            .or_else(|| env::var("PLEX_DATASOURCE_HOST").ok());

        Ok(Self {
            plex_api_key,
            plex_customer_id,
            plex_ds_host,
            plex_ds_username: env::var("PLEX_DS_USERNAME").ok(),
            plex_ds_password: env::var("PLEX_DS_PASSWORD").ok(),
            cdf_host,
            cdf_project,
            cdf_client_id,
            cdf_client_secret,
            cdf_token_url,
            plex_base_url: env_or("PLEX_BASE_URL", "https://connect.plex.com"),
            raw_database: env_or("PLEX_RAW_DATABASE", "plex_raw"),
            extractor_space: env_or("PLEX_EXTRACTOR_SPACE", "plex_extractor_runs"),
            state_directory: env_or("PLEX_STATE_DIR", "state"),
            batch_size: env_usize("PLEX_BATCH_SIZE", 1000),
            max_retries: env_u32("PLEX_MAX_RETRIES", 3),
            retry_delay_secs: env_u64("PLEX_RETRY_DELAY", 5),
            facility_name: env_or("FACILITY_NAME", ""),
            lookback: LookbackConfig {
                jobs_days: env_i64("PLEX_JOBS_LOOKBACK_DAYS", 7),
                production_days: env_i64("PRODUCTION_LOOKBACK_DAYS", 3),
                inventory_days: env_i64("INVENTORY_LOOKBACK_DAYS", 7),
                performance_days: env_i64("PERFORMANCE_LOOKBACK_DAYS", 7),
                master_days: env_i64("MASTER_LOOKBACK_DAYS", 30),
                quality_days: env_i64("QUALITY_DAYS_BACK", 30),
            },
            quality_batch_size: env_usize("QUALITY_BATCH_SIZE", 1000),
            quality_extraction_start_date: env::var("QUALITY_EXTRACTION_START_DATE").ok(),
        })
    }

    /// Build a config in-memory without touching the environment, for tests.
    pub fn for_testing() -> Self {
        Self {
            plex_api_key: "test-api-key".into(),
            plex_customer_id: "test-pcn".into(),
            plex_ds_host: Some("https://test-pcn.test.on.plex.com".into()),
            plex_ds_username: Some("ds-user".into()),
            plex_ds_password: Some("ds-pass".into()),
            cdf_host: "https://example.cognitedata.com".into(),
            cdf_project: "test-project".into(),
            cdf_client_id: "client-id".into(),
            cdf_client_secret: "client-secret".into(),
            cdf_token_url: "https://example.com/token".into(),
            plex_base_url: "https://connect.plex.com".into(),
            raw_database: "plex_raw".into(),
            extractor_space: "plex_extractor_runs".into(),
            state_directory: "state".into(),
            batch_size: 1000,
            max_retries: 3,
            retry_delay_secs: 5,
            facility_name: "TEST".into(),
            lookback: LookbackConfig::default(),
            quality_batch_size: 1000,
            quality_extraction_start_date: None,
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_i64(name: &str, default: i64) -> i64 {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
