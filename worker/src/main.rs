//! Crawling worker
//!
//! A long-running agent that maintains a stable identity, polls the
//! coordinator on the interval the coordinator dictates, executes assigned
//! work through registered task handlers, and reports results with
//! retry/backoff on transport failure.
// This is the main entry point for the worker application. It is responsible
// for:
// - Loading configuration and the persisted worker identity.
// - Initializing logging into the worker's store directory.
// - Registering task handlers and running the agent loop.

// Use jemalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use worker::agent::WorkerAgent;
use worker::config::WorkerConfig;
use worker::handler::PongHandler;
use worker::identity;

/// Version of the bundled task handlers, reported as `client-arver`.
const HANDLER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Command-line arguments for the worker
#[derive(Parser, Debug)]
#[command(name = "worker")]
#[command(about = "Crawling worker that polls the coordinator and executes assigned jobs", long_about = None)]
struct CliArgs {
    /// Path to the worker configuration file (worker.toml)
    #[arg(value_name = "CONFIG_FILE")]
    config_file: PathBuf,

    /// Override the coordinator base URL from the config file
    #[arg(long = "base-url", value_name = "URL")]
    base_url: Option<String>,

    /// Override the store directory from the config file
    #[arg(long = "store-dir", value_name = "DIR")]
    store_dir: Option<String>,
}

/// Sets up signal handlers for graceful shutdown.
async fn setup_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let sigterm = signal(SignalKind::terminate());
        let sigint = signal(SignalKind::interrupt());

        match (sigterm, sigint) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to register signal handlers: {}", e);
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to wait for Ctrl+C: {}", e);
                } else {
                    info!("Received Ctrl+C");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to receive Ctrl+C signal: {}", e);
        } else {
            info!("Received Ctrl+C");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    // Configuration has to come first: the log lives in the store directory
    let mut config = match WorkerConfig::load(&cli_args.config_file) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };
    if let Some(base_url) = cli_args.base_url {
        config.base_url = base_url;
    }
    if let Some(store_dir) = cli_args.store_dir {
        config.store_dir = store_dir;
    }
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration after command-line overrides: {:#}", e);
        std::process::exit(1);
    }

    let store_dir = config.store_dir_path();
    if let Err(e) = std::fs::create_dir_all(&store_dir) {
        eprintln!("Failed to create store directory {}: {}", store_dir.display(), e);
        std::process::exit(1);
    }

    // Append-only log next to the identity file: <store_dir>/<hostname>.log
    let host = identity::local_hostname();
    let file_appender =
        tracing_appender::rolling::never(&store_dir, identity::log_file_name(&host));
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("worker=info,shared=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(non_blocking)
        .init();

    info!("STARTED");
    info!(
        base_url = %config.base_url_trimmed(),
        store_dir = %store_dir.display(),
        "Worker configuration loaded"
    );

    let client_id =
        match identity::get_or_create_peer_id(&identity::id_file_path(&store_dir, &host)) {
            Ok(id) => id,
            Err(e) => {
                error!("Failed to establish worker identity: {:#}", e);
                std::process::exit(1);
            }
        };
    info!(client_id = %client_id, hostname = %host, "Worker identity established");

    let mut agent = match WorkerAgent::new(
        config.base_url_trimmed(),
        store_dir,
        client_id,
        &host,
        HANDLER_VERSION,
    ) {
        Ok(agent) => agent,
        Err(e) => {
            error!("Failed to initialize worker agent: {:#}", e);
            std::process::exit(1);
        }
    };

    // Register command handlers. Real deployments plug their article
    // retrievers in here; PONG is the bundled liveness check.
    agent.register_handler("PONG", "pong", Box::new(PongHandler));

    tokio::select! {
        result = agent.run() => {
            if let Err(e) = result {
                error!("Worker error: {:#}", e);
                std::process::exit(1);
            }
        }
        _ = setup_shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    info!("Worker shutdown complete");
    Ok(())
}
