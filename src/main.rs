//! statcache - cached COVID-19 statistics from the command line
//!
//! Resolves one view through the cache, prints it as JSON on stdout and
//! exits. Logs go to stderr.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use reqwest::Url;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use statcache::cache::Orchestrator;
use statcache::cli::{Cli, Command};
use statcache::config::Config;
use statcache::data::HttpUpstream;
use statcache::error::{ApiError, ErrorKind};
use statcache::refresh::{RefreshConfig, RefreshHandle, RefreshMessage};
use statcache::service::{Served, StatsService};

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "statcache=info".into()),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

/// Prints a served view to stdout, logging any non-fatal warnings
fn emit<T: Serialize>(served: Served<T>) -> Result<(), ApiError> {
    for warning in &served.warnings {
        warn!("{}", warning);
    }
    let json = serde_json::to_string_pretty(&served.data)
        .map_err(|e| ApiError::new(ErrorKind::MalformedPayload, e.to_string()))?;
    println!("{}", json);
    Ok(())
}

async fn run(cli: Cli, service: StatsService, config: &Config) -> Result<(), ApiError> {
    let countries = cli.compare_countries();
    match cli.command {
        Command::Global => emit(service.global().await?),
        Command::Countries => emit(service.countries().await?),
        Command::Directory => emit(service.directory().await?),
        Command::Country { name } => emit(service.country(&name).await?),
        Command::History { country, days } => emit(service.historical(&country, days).await?),
        Command::Vaccination { country, days } => {
            emit(service.vaccination(&country, days).await?)
        }
        Command::Compare { metric: None, .. } => emit(service.compare(&countries).await?),
        Command::Compare {
            metric: Some(metric),
            ..
        } => emit(service.compare_metric(&countries, &metric).await?),
        Command::Risk { country } => emit(service.risk(&country).await?),
        Command::Export { country } => emit(service.export(&country).await?),
        Command::Watch => {
            watch(service.orchestrator().clone(), RefreshConfig::from(config)).await;
            Ok(())
        }
    }
}

/// Runs the background refresher until Ctrl-C
async fn watch(orchestrator: Orchestrator, config: RefreshConfig) {
    if !config.enabled {
        warn!("background refresh is disabled in config; nothing to watch");
        return;
    }
    info!(interval = ?config.interval, "watching");
    let mut handle = RefreshHandle::spawn(orchestrator, config);

    loop {
        tokio::select! {
            message = handle.receiver.recv() => match message {
                Some(RefreshMessage::RefreshCompleted) => info!("refresh cycle completed"),
                Some(RefreshMessage::RefreshError(e)) => warn!("refresh failed: {}", e),
                Some(_) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }
    handle.shutdown().await;
}

fn fail(err: &ApiError) -> ExitCode {
    match serde_json::to_string_pretty(err) {
        Ok(json) => eprintln!("{}", json),
        Err(_) => eprintln!("{}", err),
    }
    ExitCode::FAILURE
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => return fail(&ApiError::bad_request(e.to_string())),
    };

    // validate() already checked the URL
    let base_url = match Url::parse(&config.base_url) {
        Ok(url) => url,
        Err(e) => return fail(&ApiError::bad_request(format!("invalid base_url: {}", e))),
    };
    let upstream = match HttpUpstream::new(base_url, config.upstream_timeout()) {
        Ok(upstream) => upstream,
        Err(e) => {
            return fail(&ApiError::new(
                ErrorKind::Unreachable,
                format!("failed to build HTTP client: {}", e),
            ))
        }
    };

    let store = config.snapshot_store();
    info!(snapshots = %store.root().display(), "starting");
    let orchestrator = Orchestrator::new(Arc::new(upstream), store, config.orchestrator_config());
    let service = StatsService::from_config(orchestrator, &config);

    match run(cli, service, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => fail(&e),
    }
}
