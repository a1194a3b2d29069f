// Copyright (c) Plex Ingestion Engineers
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use plex_ingestion_core::{run_cycle, Extractor, RawSinkClient, WatermarkStore};
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Per-extractor run counters, mirroring `ExtractorStatus` in the source
/// orchestrator.
#[derive(Debug, Clone, Default)]
pub struct RunStatus {
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub run_count: u64,
    pub error_count: u64,
    pub currently_running: bool,
}

struct RegisteredExtractor {
    name: String,
    extractor: Box<dyn Extractor>,
    watermark: Mutex<WatermarkStore>,
}

/// Default sequential runner: iterates extractors in
/// registration order, optionally looping on an interval, with a
/// cooperative shutdown flag polled between iterations.
pub struct SequentialRunner {
    extractors: Vec<RegisteredExtractor>,
    sink: Arc<dyn RawSinkClient>,
    database: String,
    metadata_space: String,
    statuses: Mutex<HashMap<String, RunStatus>>,
    shutdown: Arc<Notify>,
}

impl SequentialRunner {
    pub fn new(sink: Arc<dyn RawSinkClient>, database: impl Into<String>, metadata_space: impl Into<String>) -> Self {
        Self {
            extractors: Vec::new(),
            sink,
            database: database.into(),
            metadata_space: metadata_space.into(),
            statuses: Mutex::new(HashMap::new()),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, extractor: Box<dyn Extractor>, watermark: WatermarkStore) {
        let name = name.into();
        self.extractors.push(RegisteredExtractor {
            name,
            extractor,
            watermark: Mutex::new(watermark),
        });
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub async fn status(&self, name: &str) -> Option<RunStatus> {
        self.statuses.lock().await.get(name).cloned()
    }

    /// Run every registered extractor once, in registration order. Per-
    /// extractor failures are logged and counted; they never abort the loop.
    pub async fn run_once(&self, selected: Option<&[String]>) {
        for registered in &self.extractors {
            if let Some(selected) = selected {
                if !selected.iter().any(|s| s == &registered.name) {
                    continue;
                }
            }
            self.run_one(registered).await;
        }
    }

    /// Loop `run_once` until `max_iterations` completes or shutdown is
    /// signaled, sleeping `interval` seconds between iterations when both
    /// `interval > 0` and more than one iteration remains.
    pub async fn run_loop(&self, selected: Option<&[String]>, interval_secs: u64, max_iterations: u64) {
        let mut iteration = 0u64;
        loop {
            self.run_once(selected).await;
            iteration += 1;
            if max_iterations > 0 && iteration >= max_iterations {
                break;
            }
            if interval_secs == 0 {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(StdDuration::from_secs(interval_secs)) => {}
                _ = self.shutdown.notified() => {
                    info!("shutdown signaled, stopping runner loop");
                    break;
                }
            }
        }
    }

    async fn run_one(&self, registered: &RegisteredExtractor) {
        let started = Utc::now();
        {
            let mut statuses = self.statuses.lock().await;
            let status = statuses.entry(registered.name.clone()).or_default();
            status.last_run = Some(started);
            status.run_count += 1;
            status.currently_running = true;
        }

        let mut watermark = registered.watermark.lock().await;
        let result = run_cycle(
            registered.extractor.as_ref(),
            self.sink.as_ref(),
            &mut watermark,
            &self.database,
            &self.metadata_space,
        )
        .await;

        let mut statuses = self.statuses.lock().await;
        let status = statuses.entry(registered.name.clone()).or_default();
        status.currently_running = false;
        match result {
            Ok(report) => {
                status.last_success = Some(Utc::now());
                info!(extractor = %registered.name, ?report, "extractor cycle succeeded");
            }
            Err(err) => {
                status.error_count += 1;
                status.last_error = Some(err.to_string());
                error!(extractor = %registered.name, error = %err, "extractor cycle failed");
            }
        }
    }
}

/// Default per-extractor periods (seconds), grounded on `ExtractorType`'s
/// period map in the source orchestrator.
pub const DEFAULT_PERIODS: &[(&str, u64)] = &[
    ("jobs", 300),
    ("production", 300),
    ("inventory", 300),
    ("performance", 300),
    ("quality", 300),
    ("master_data", 86_400),
];

/// Concurrent orchestrator: one task per
/// extractor, each looping `{sleep(period), run cycle}`, bounded by a
/// semaphore of size `max_concurrent_extractors`. A per-extractor mutex
/// (held across the semaphore wait) disallows overlapping cycles for the
/// same extractor. A background task logs a health snapshot every
/// `health_check_interval` seconds. Graceful shutdown gives running tasks
/// `graceful_shutdown_timeout` seconds to finish before the remainder are
/// aborted.
pub struct ConcurrentOrchestrator {
    runner: Arc<SequentialRunner>,
    periods: HashMap<String, u64>,
    max_concurrent_extractors: usize,
    health_check_interval_secs: u64,
    graceful_shutdown_timeout_secs: u64,
}

impl ConcurrentOrchestrator {
    pub fn new(runner: Arc<SequentialRunner>) -> Self {
        Self {
            runner,
            periods: DEFAULT_PERIODS.iter().map(|(name, secs)| (name.to_string(), *secs)).collect(),
            max_concurrent_extractors: 3,
            health_check_interval_secs: 60,
            graceful_shutdown_timeout_secs: 30,
        }
    }

    pub fn with_period(mut self, extractor_name: impl Into<String>, period_secs: u64) -> Self {
        self.periods.insert(extractor_name.into(), period_secs);
        self
    }

    pub fn with_max_concurrent_extractors(mut self, n: usize) -> Self {
        self.max_concurrent_extractors = n.max(1);
        self
    }

    pub fn with_health_check_interval_secs(mut self, secs: u64) -> Self {
        self.health_check_interval_secs = secs;
        self
    }

    pub fn with_graceful_shutdown_timeout_secs(mut self, secs: u64) -> Self {
        self.graceful_shutdown_timeout_secs = secs;
        self
    }

    /// Runs until `shutdown` is signaled, then gives in-flight cycles
    /// `graceful_shutdown_timeout_secs` to finish before aborting the rest.
    pub async fn run(&self, extractor_names: &[String], shutdown: Arc<Notify>) {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_extractors));
        let mut tasks = JoinSet::new();

        for name in extractor_names {
            let period_secs = self.periods.get(name).copied().unwrap_or(300);
            let runner = self.runner.clone();
            let semaphore = semaphore.clone();
            let shutdown = shutdown.clone();
            let name = name.clone();
            tasks.spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(StdDuration::from_secs(period_secs)) => {}
                        _ = shutdown.notified() => break,
                    }
                    let Ok(_permit) = semaphore.acquire().await else { break };
                    runner.run_once(Some(std::slice::from_ref(&name))).await;
                }
            });
        }

        let health_shutdown = shutdown.clone();
        let health_runner = self.runner.clone();
        let health_interval = self.health_check_interval_secs;
        let health_names: Vec<String> = extractor_names.to_vec();
        tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(StdDuration::from_secs(health_interval)) => {
                        for name in &health_names {
                            if let Some(status) = health_runner.status(name).await {
                                info!(extractor = %name, run_count = status.run_count, error_count = status.error_count, last_error = ?status.last_error, "health snapshot");
                            }
                        }
                    }
                    _ = health_shutdown.notified() => break,
                }
            }
        });

        shutdown.notified().await;
        let deadline = StdDuration::from_secs(self.graceful_shutdown_timeout_secs);
        if tokio::time::timeout(deadline, async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            warn!("graceful shutdown timeout elapsed, aborting remaining extractor tasks");
            tasks.shutdown().await;
        }
    }
}
