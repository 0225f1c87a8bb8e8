#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # sms-dispatch
//!
//! Message-bus-driven SMS dispatch service: consumes send requests from a
//! durable bus topic, transmits them through a pool of AT-command cellular
//! modems, and publishes its accepted-request schema to a discovery store.
//!
//! ## Subcommands
//!
//! - `sms-dispatch serve` (default) — run the dispatch service

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use sms_dispatch::bus::memory::MemoryBus;
use sms_dispatch::bus::Consumer;
use sms_dispatch::config::Config;
use sms_dispatch::orchestrator::Orchestrator;

/// Message-bus-driven SMS dispatch service.
#[derive(Parser)]
#[command(name = "sms-dispatch", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dispatch service (default when no subcommand given).
    Serve {
        /// Path to YAML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => std::env::args()
            .collect::<Vec<_>>()
            .windows(2)
            .find(|w| w[0] == "--config")
            .map(|w| w[1].clone()),
    };

    run_server(config_path.as_deref()).await;
}

async fn run_server(config_path: Option<&str>) {
    let config = match Config::load(config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("config error: {e}");
            std::process::exit(1);
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("sms-dispatch v{} starting", env!("CARGO_PKG_VERSION"));
    info!(service = %config.name, main_topic = %config.main_topic(), "service identity");

    // Pending real bus-client wiring: the abstract `Consumer` contract is
    // implemented here by an in-memory bus until a production Pulsar
    // client is written against it (out of scope — see spec notes).
    let bus: Arc<dyn Consumer> = Arc::new(MemoryBus::new());
    warn!("no production bus client configured, running against an in-memory bus");

    let (orchestrator, health_handle, consumer_handle) =
        match Orchestrator::start(config, bus).await {
            Ok(parts) => parts,
            Err(e) => {
                error!("startup failed: {e}");
                std::process::exit(1);
            }
        };

    let shutdown_signal = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("received SIGINT");
        }
    };

    let cancel = orchestrator.cancellation_token();
    tokio::select! {
        () = shutdown_signal => {
            cancel.cancel();
        }
        () = cancel.cancelled() => {}
    }

    info!("shutting down...");
    orchestrator.shutdown(health_handle, consumer_handle).await;
    info!("goodbye");
}
