// SPDX-License-Identifier: MIT
use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use orchd::config::{self, ConfigWatcher, HotConfig, OrchestratorConfig};
use orchd::deployment::orchestrator::Orchestrator;
use orchd::rest;
use orchd::AppContext;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "orchd", about = "Deployment orchestrator service", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// REST API bind port.
    #[arg(long, env = "ORCHD_PORT")]
    port: Option<u16>,

    /// Data directory for the SQLite database and native-runtime scratch space.
    #[arg(long, env = "ORCHD_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "ORCHD_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "ORCHD_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,

    /// Path to an `orchd.toml` config file.
    #[arg(long, env = "ORCHD_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Directory holding one subdirectory per project_id's source files.
    #[arg(long, env = "ORCHD_SNAPSHOTS_DIR")]
    snapshots_dir: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the orchestrator server (default when no subcommand given).
    Serve,
    /// Check that the data directory, database, and driver registry are
    /// reachable without starting the server.
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = args.log.clone().unwrap_or_else(|| "info".to_string());
    let _log_guard = orchd::logging::init(&log_level, args.log_file.as_deref());

    let toml_config = match &args.config {
        Some(path) => config::load_toml(path)?,
        None => config::TomlConfig::default(),
    };
    let resolved = OrchestratorConfig::resolve(
        args.port,
        args.data_dir.clone(),
        args.log.clone(),
        args.log_file.clone(),
        args.snapshots_dir.clone(),
        toml_config,
    );

    match args.command {
        Some(Command::Doctor) => run_doctor(resolved).await,
        None | Some(Command::Serve) => run_serve(resolved, args.config).await,
    }
}

async fn run_serve(config: OrchestratorConfig, config_path: Option<std::path::PathBuf>) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "orchd starting");
    info!(
        data_dir = %config.data_dir.display(),
        port = config.port,
        max_concurrent_deployments = config.max_concurrent_deployments,
        "config loaded"
    );

    // Watching requires a config file to re-read on change; without one
    // there is nothing to hot-reload from, so the sweep interval just stays
    // fixed at its resolved value.
    let watcher = match &config_path {
        Some(path) => Some(
            ConfigWatcher::start(
                path.clone(),
                HotConfig {
                    log_level: config.log.clone(),
                    stall_sweep_interval_secs: config.stall_sweep_interval_secs,
                },
            )
            .context("starting config watcher")?,
        ),
        None => None,
    };
    let hot = match &watcher {
        Some(w) => w.hot.clone(),
        None => std::sync::Arc::new(tokio::sync::RwLock::new(HotConfig {
            log_level: config.log.clone(),
            stall_sweep_interval_secs: config.stall_sweep_interval_secs,
        })),
    };

    let bind: SocketAddr = format!("0.0.0.0:{}", config.port)
        .parse()
        .context("invalid bind address")?;

    let ctx = AppContext::bootstrap(config).await?;
    let orchestrator: Arc<Orchestrator> = ctx.orchestrator.clone();

    let recovered = orchestrator.recover_stale_deployments().await.context("recovering stale deployments")?;
    if recovered > 0 {
        info!(recovered, "force-failed deployments left non-terminal by a previous process");
    }

    let sweep_handle = orchestrator.spawn_stall_sweep(hot);

    let server = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { rest::start_rest_server(orchestrator, bind).await }
    });

    tokio::select! {
        result = server => {
            result.context("REST server task panicked")??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, draining in-flight deployments");
        }
    }

    sweep_handle.abort();
    orchestrator.drain().await;
    info!("orchd stopped");
    Ok(())
}

async fn run_doctor(config: OrchestratorConfig) -> Result<()> {
    println!("orchd doctor");
    println!("  data_dir: {}", config.data_dir.display());

    match orchd::deployment::Storage::new(&config.data_dir).await {
        Ok(_) => println!("  [ok] sqlite database reachable (WAL mode, migrations applied)"),
        Err(e) => {
            println!("  [fail] sqlite database: {e:#}");
            std::process::exit(1);
        }
    }

    for tag in ["content-digest", "native"] {
        match config.provider_profile(tag) {
            Some(profile) if profile.base_url.is_some() => {
                println!("  [ok] provider '{tag}' configured");
            }
            _ => println!("  [warn] provider '{tag}' has no base_url configured"),
        }
    }

    println!("  [ok] driver registry: content-digest-v1, native");
    Ok(())
}
