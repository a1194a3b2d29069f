// Copyright (c) Plex Ingestion Engineers
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Error taxonomy for the ingestion engine.
///
/// `Upstream` and `Transient` are produced by the HTTP/DataSource clients;
/// `MissingIdentifier` and `UnsupportedTimestamp` are per-record and are
/// handled (logged + dropped) by the extractor cycle rather than aborting it.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("upstream returned status {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("transient network error: {0}")]
    Transient(String),

    #[error("record missing identifier: {0}")]
    MissingIdentifier(String),

    #[error("unsupported timestamp value: {0}")]
    UnsupportedTimestamp(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IngestError>;

impl IngestError {
    /// True for errors the HTTP retry loop should retry on.
    pub fn is_retriable(&self) -> bool {
        matches!(self, IngestError::Transient(_))
    }
}

impl From<reqwest::Error> for IngestError {
    fn from(err: reqwest::Error) -> Self {
        IngestError::Transient(err.to_string())
    }
}
