// Copyright (c) Plex Ingestion Engineers
// SPDX-License-Identifier: Apache-2.0

pub mod common;
pub mod inventory;
pub mod jobs;
pub mod master_data;
pub mod performance;
pub mod production;
pub mod quality;

pub use inventory::InventoryExtractor;
pub use jobs::JobsExtractor;
pub use master_data::MasterDataExtractor;
pub use performance::PerformanceExtractor;
pub use production::ProductionExtractor;
pub use quality::QualityExtractor;
