// Copyright (c) Plex Ingestion Engineers
// SPDX-License-Identifier: Apache-2.0

pub mod extractors;
pub mod runner;

pub use extractors::{
    InventoryExtractor, JobsExtractor, MasterDataExtractor, PerformanceExtractor, ProductionExtractor, QualityExtractor,
};
pub use runner::{ConcurrentOrchestrator, RunStatus, SequentialRunner, DEFAULT_PERIODS};
