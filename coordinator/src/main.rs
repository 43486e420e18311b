//! Distributed crawling coordinator
//!
//! The coordinator partitions the crawling workload into independent jobs,
//! hands them out to remote workers over a small request/reply protocol,
//! tracks liveness and progress, persists durable state across restarts,
//! and recovers jobs abandoned by failed workers.
// This is the main entry point for the coordinator. It's responsible for:
// - Initializing logging and configuration.
// - Opening the durable stores and replaying pending jobs.
// - Running the beat timer and the HTTP server.
// - Handling graceful shutdown.

// Use jemalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{error, info};

mod api;
mod config;
mod controller;
mod registry;
mod scheduler;
mod store;

use api::{AppState, ControllerEntry, CoordinatorState};
use config::CoordinatorConfig;
use controller::TaskController;
use registry::ClientRegistry;
use scheduler::Scheduler;

/// Command-line arguments for the coordinator
#[derive(Parser, Debug)]
#[command(name = "coordinator")]
#[command(about = "Central coordinator that hands crawling jobs to remote workers", long_about = None)]
struct CliArgs {
    /// Path to the coordinator configuration file (coordinator.toml)
    #[arg(value_name = "CONFIG_FILE")]
    config_file: PathBuf,

    /// Override the listen address from the config file
    #[arg(long = "listen-address", value_name = "ADDRESS")]
    listen_address: Option<String>,

    /// Override the beat interval from the config file
    #[arg(long = "interval", value_name = "SECONDS")]
    interval: Option<u64>,

    /// Override the state directory from the config file
    #[arg(long = "state-dir", value_name = "DIR")]
    state_dir: Option<String>,
}

/// The main application structure for the coordinator.
pub struct Coordinator {
    config: CoordinatorConfig,
    listen_address: SocketAddr,
    state: Arc<Mutex<CoordinatorState>>,
}

impl Coordinator {
    /// Open the durable stores, rebuild the scheduler queues from the
    /// pending stores, and register the configured seed jobs.
    pub fn new(config: CoordinatorConfig) -> Result<Self> {
        let listen_address: SocketAddr = config.listen_address.parse().map_err(|e| {
            anyhow::anyhow!("Invalid listen address '{}': {}", config.listen_address, e)
        })?;

        let state_dir = PathBuf::from(&config.state_dir);
        let mut scheduler = Scheduler::new(config.interval_seconds);
        let registry = ClientRegistry::open(config.storage, &state_dir)
            .context("Failed to open the client registry")?;

        let mut controllers = Vec::with_capacity(config.tasks.len());
        for task in &config.tasks {
            let controller = TaskController::open(
                config.storage,
                &state_dir,
                &task.prefix,
                &task.action,
                &PathBuf::from(&task.artifact_dir),
                &task.artifact_suffix,
            )
            .with_context(|| format!("Failed to open task controller {}", task.action))?;
            controller.register_pending(&mut scheduler)?;
            controllers.push(ControllerEntry {
                path: task.path.clone(),
                fan_out: task.fan_out.clone(),
                controller,
            });
        }

        // Seed the initial frontier; add_job skips anything already known
        for seed in &config.seeds {
            if let Some(entry) = controllers
                .iter_mut()
                .find(|e| e.controller.action() == seed.action)
            {
                if entry.controller.add_job(&mut scheduler, &seed.params)? {
                    info!(action = %seed.action, params = %seed.params, "Seed job registered");
                }
            }
        }

        Ok(Self {
            config,
            listen_address,
            state: Arc::new(Mutex::new(CoordinatorState {
                scheduler,
                registry,
                controllers,
            })),
        })
    }

    /// Run the beat timer and the HTTP server until a shutdown signal.
    pub async fn run(&mut self, shutdown_tx: broadcast::Sender<()>) -> Result<()> {
        info!("Starting the crawling coordinator");

        let (interval_tx, mut interval_rx) = watch::channel(self.config.interval_seconds);

        // The beat task. The first beat fires immediately, as does the first
        // beat after a reschedule - the legacy timer restarted hot.
        let beat_state = Arc::clone(&self.state);
        let mut beat_shutdown_rx = shutdown_tx.subscribe();
        let beat_task = tokio::spawn(async move {
            let mut interval_secs = *interval_rx.borrow();
            beat_state.lock().await.scheduler.beat();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(interval_secs)) => {
                        beat_state.lock().await.scheduler.beat();
                    }
                    changed = interval_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        interval_secs = *interval_rx.borrow();
                        info!(interval = interval_secs, "Beat timer rearmed");
                        beat_state.lock().await.scheduler.beat();
                    }
                    _ = beat_shutdown_rx.recv() => {
                        info!("Beat task received shutdown signal");
                        break;
                    }
                }
            }
        });

        let app_state = AppState {
            state: Arc::clone(&self.state),
            interval_tx,
            shutdown_tx: shutdown_tx.clone(),
        };
        let app = api::create_router(app_state, self.config.max_body_mb * 1024 * 1024);

        info!("Starting HTTP server on {}", self.listen_address);
        let listener = tokio::net::TcpListener::bind(self.listen_address)
            .await
            .with_context(|| {
                format!(
                    "Failed to bind TCP listener to {}. \
                     Check if the port is already in use (EADDRINUSE) or requires elevated permissions (EACCES).",
                    self.listen_address
                )
            })?;

        let shutdown_signal = {
            let mut rx = shutdown_tx.subscribe();
            async move {
                let _ = rx.recv().await;
                info!("HTTP server received shutdown signal");
            }
        };

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        // The watch sender dropped with the router; the beat task notices
        // and exits, but nudge it anyway and wait for it.
        let _ = shutdown_tx.send(());
        let _ = beat_task.await;

        info!("Coordinator stopped");
        Ok(())
    }
}

/// Sets up signal handlers for graceful shutdown.
/// Returns a future that completes when a shutdown signal is received.
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
                error!("Falling back to Ctrl+C only");
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
    // Initialize logging.
    let file_appender = tracing_appender::rolling::daily("./logs", "coordinator.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("coordinator=info,shared=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    let cli_args = CliArgs::parse();
    info!("Coordinator starting up");
    info!("Configuration file: {}", cli_args.config_file.display());

    let mut config = match CoordinatorConfig::load(&cli_args.config_file) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    // Apply command-line overrides
    if let Some(listen_address) = cli_args.listen_address {
        info!("Listen address override provided via command line");
        config.listen_address = listen_address;
    }
    if let Some(interval) = cli_args.interval {
        info!("Beat interval override provided via command line");
        config.interval_seconds = interval;
    }
    if let Some(state_dir) = cli_args.state_dir {
        info!("State directory override provided via command line");
        config.state_dir = state_dir;
    }
    if let Err(e) = config.validate() {
        error!("Invalid configuration after command-line overrides: {:#}", e);
        std::process::exit(1);
    }

    let mut coordinator = match Coordinator::new(config) {
        Ok(coordinator) => coordinator,
        Err(e) => {
            error!("Failed to initialize coordinator: {:#}", e);
            std::process::exit(1);
        }
    };

    // One shutdown channel feeds the HTTP server, the beat task, and
    // /quitquitquit.
    let (shutdown_tx, _) = broadcast::channel(1);

    tokio::select! {
        result = coordinator.run(shutdown_tx.clone()) => {
            if let Err(e) = result {
                error!("Coordinator error: {:#}", e);
                std::process::exit(1);
            }
        }
        _ = setup_shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown");
            let _ = shutdown_tx.send(());
        }
    }

    info!("Coordinator shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests;
