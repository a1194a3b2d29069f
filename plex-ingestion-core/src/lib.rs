// Copyright (c) Plex Ingestion Engineers
// SPDX-License-Identifier: Apache-2.0

//! Core building blocks for the Plex-to-raw-landing ingestion engine:
//! HTTP/DataSource clients, watermark persistence, record canonicalization,
//! the raw sink abstraction, and the shared extraction cycle algorithm.
//! Domain-specific extractors live in the `plex-ingestion` binary crate.

pub mod canonical;
pub mod config;
pub mod datasource;
pub mod error;
pub mod extractor;
pub mod http;
pub mod sink;
pub mod timestamp;
pub mod watermark;

pub use canonical::{canonicalize, Row};
pub use config::{LookbackConfig, PlexIngestionConfig};
pub use datasource::PlexDataSourceClient;
pub use error::{IngestError, Result};
pub use extractor::{run_cycle, CycleReport, Extractor};
pub use http::PlexHttpClient;
pub use sink::{HttpRawSinkClient, MetadataNode, MockRawSinkClient, RawSinkClient};
pub use watermark::WatermarkStore;
