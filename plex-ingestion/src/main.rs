// Copyright (c) Plex Ingestion Engineers
// SPDX-License-Identifier: Apache-2.0

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use plex_ingestion::{
    ConcurrentOrchestrator, InventoryExtractor, JobsExtractor, MasterDataExtractor, PerformanceExtractor,
    ProductionExtractor, QualityExtractor, SequentialRunner,
};
use plex_ingestion_core::{
    Extractor, HttpRawSinkClient, PlexDataSourceClient, PlexHttpClient, PlexIngestionConfig, WatermarkStore,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Plex MES raw-rows ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every selected extractor in turn, optionally looping on an interval.
    RunAll {
        /// Names to run; defaults to all six when omitted.
        #[arg(long, value_delimiter = ',')]
        extractors: Vec<String>,

        /// Seconds between iterations; 0 runs once and exits.
        #[arg(long, default_value_t = 0)]
        interval: u64,

        /// Stop after this many iterations; 0 means unbounded (subject to `interval`).
        #[arg(long, default_value_t = 1)]
        max_iterations: u64,

        /// Log verbosity, also settable via `RUST_LOG`.
        #[arg(long, default_value = "INFO")]
        log_level: String,

        /// Use the concurrent orchestrator (per-extractor task + own period) instead
        /// of the sequential loop. Runs until Ctrl-C.
        #[arg(long)]
        concurrent: bool,
    },
}

const ALL_EXTRACTORS: &[&str] = &["jobs", "production", "inventory", "performance", "quality", "master_data"];

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Command::RunAll {
            extractors,
            interval,
            max_iterations,
            log_level,
            concurrent,
        } => run_all(extractors, interval, max_iterations, &log_level, concurrent).await,
    }
}

async fn run_all(extractors: Vec<String>, interval: u64, max_iterations: u64, log_level: &str, concurrent: bool) -> ExitCode {
    init_tracing(log_level);

    let config = match PlexIngestionConfig::from_env() {
        Ok(c) => c,
        Err(err) => {
            eprintln!("fatal: {err}");
            return ExitCode::FAILURE;
        }
    };

    let selected: Vec<String> = if extractors.is_empty() {
        ALL_EXTRACTORS.iter().map(|s| s.to_string()).collect()
    } else {
        extractors
    };

    let http = PlexHttpClient::with_retry(
        config.plex_base_url.as_str(),
        config.plex_api_key.as_str(),
        config.plex_customer_id.as_str(),
        config.max_retries,
        Duration::from_secs(config.retry_delay_secs),
    );
    let datasource = match config.plex_ds_host.as_deref() {
        Some(host) => PlexDataSourceClient::with_retry(
            host,
            config.plex_ds_username.clone().unwrap_or_default(),
            config.plex_ds_password.clone().unwrap_or_default(),
            config.max_retries,
            Duration::from_secs(config.retry_delay_secs),
        ),
        None => PlexDataSourceClient::new("https://unset.on.plex.com", "", ""),
    };
    let sink = Arc::new(HttpRawSinkClient::new(
        config.cdf_host.as_str(),
        config.cdf_project.as_str(),
        config.cdf_token_url.as_str(),
        config.cdf_client_id.as_str(),
        config.cdf_client_secret.as_str(),
        config.batch_size,
    ));

    let mut runner = SequentialRunner::new(sink, config.raw_database.clone(), config.extractor_space.clone());

    let quality_start_date = config
        .quality_extraction_start_date
        .as_deref()
        .and_then(|s| plex_ingestion_core::timestamp::try_parse_timestamp(&serde_json::Value::String(s.to_string())));

    let state_dir = std::path::Path::new(&config.state_directory);
    for name in &selected {
        let watermark = match WatermarkStore::open(state_dir, name).with_context(|| format!("opening watermark state for {name}")) {
            Ok(w) => w,
            Err(err) => {
                eprintln!("fatal: {err:#}");
                return ExitCode::FAILURE;
            }
        };
        let extractor: Box<dyn Extractor> = match name.as_str() {
            "jobs" => Box::new(JobsExtractor::new(
                http.clone(),
                config.lookback.jobs_days,
                config.plex_customer_id.clone(),
                config.facility_name.clone(),
            )),
            "production" => Box::new(ProductionExtractor::new(
                http.clone(),
                config.lookback.production_days,
                config.plex_customer_id.clone(),
                config.facility_name.clone(),
            )),
            "inventory" => Box::new(InventoryExtractor::new(
                http.clone(),
                config.lookback.inventory_days,
                config.plex_customer_id.clone(),
                config.facility_name.clone(),
            )),
            "performance" => Box::new(PerformanceExtractor::new(
                http.clone(),
                config.lookback.performance_days,
                config.plex_customer_id.clone(),
                config.facility_name.clone(),
            )),
            "quality" => Box::new(QualityExtractor::new(
                datasource.clone(),
                config.quality_batch_size as i64,
                config.plex_customer_id.clone(),
                config.facility_name.clone(),
                config.lookback.quality_days,
                quality_start_date,
            )),
            "master_data" => Box::new(MasterDataExtractor::new(
                http.clone(),
                config.lookback.master_days,
                config.plex_customer_id.clone(),
                config.facility_name.clone(),
            )),
            other => {
                eprintln!("fatal: unknown extractor {other}");
                return ExitCode::FAILURE;
            }
        };
        runner.register(name.clone(), extractor, watermark);
    }

    let runner = Arc::new(runner);
    let shutdown = runner.shutdown_handle();
    let shutdown_for_signal = shutdown.clone();
    let names = selected.clone();

    let mut run_handle = if concurrent {
        let orchestrator = ConcurrentOrchestrator::new(runner);
        tokio::spawn(async move { orchestrator.run(&names, shutdown).await })
    } else {
        tokio::spawn(async move { runner.run_loop(Some(&names), interval, max_iterations).await })
    };

    tokio::select! {
        _ = &mut run_handle => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("ctrl-c received, shutting down");
            shutdown_for_signal.notify_waiters();
            let _ = run_handle.await;
        }
    }
    ExitCode::SUCCESS
}

fn init_tracing(log_level: &str) {
    let directive = match log_level.to_uppercase().as_str() {
        "DEBUG" => "debug",
        "WARNING" => "warn",
        "ERROR" => "error",
        "CRITICAL" => "error",
        _ => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
