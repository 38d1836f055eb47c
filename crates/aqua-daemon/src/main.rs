// crates/aqua-daemon/src/main.rs
//
// Binary entrypoint for the Aqua ledger daemon.
//
// Loads configuration, initializes tracing, opens the RocksDB ledger, wires
// the ledger services, then either runs the reconciliation scheduler or a
// one-shot operator command.

mod commands;
mod config;
mod forecast;
mod output;
mod scheduler;

use std::sync::Arc;

use clap::Parser;

use aqua_core::clock::SystemClock;
use aqua_core::context::CallerContext;
use aqua_core::traits::LedgerStore;
use aqua_core::unit::Principal;
use aqua_ledger::LedgerServices;
use aqua_store::RocksStore;

use commands::{Command, CommandContext};
use config::{expand_tilde, DaemonConfig};
use forecast::HttpUsageSource;
use output::OutputFormat;
use scheduler::ReconcileScheduler;

/// Aqua water-token ledger daemon and operator tools.
#[derive(Parser, Debug)]
#[command(name = "aqua", version = "0.1.0", about = "Aqua water-token ledger")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "~/.aqua/config.toml")]
    config: String,

    /// Override the configured data directory.
    #[arg(long, global = true)]
    data_dir: Option<String>,

    /// Print JSON instead of tables.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config_path = expand_tilde(&args.config);
    let loaded = DaemonConfig::load(&config_path);
    let log_level = loaded
        .as_ref()
        .map(|c| c.log_level.clone())
        .unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut daemon_config = match loaded {
        Ok(cfg) => {
            tracing::info!("Loaded configuration from {}", config_path);
            cfg
        }
        Err(e) => {
            tracing::warn!(
                "Could not load config from {}: {}. Using defaults.",
                config_path,
                e
            );
            DaemonConfig::default()
        }
    };

    // CLI --data-dir flag overrides the config file value.
    if let Some(dir) = &args.data_dir {
        daemon_config.data_dir = dir.clone();
    }

    let data_dir = expand_tilde(&daemon_config.data_dir);
    std::fs::create_dir_all(&data_dir)?;
    let db_path = format!("{}/ledger_rocksdb", data_dir);
    let store: Arc<dyn LedgerStore> = Arc::new(RocksStore::open(&db_path)?);
    tracing::info!("Ledger opened at {}", db_path);

    let history = Arc::new(HttpUsageSource::new(&daemon_config.forecast_url)?);
    let services = LedgerServices::new(
        store.clone(),
        history,
        Arc::new(SystemClock),
        daemon_config.ledger_config(),
    )?;

    match &args.command {
        Command::Run => {
            tracing::info!("Aqua daemon v0.1.0");
            tracing::info!("Forecast service: {}", daemon_config.forecast_url);
            tracing::info!(
                "Cadence: {:?}, debt mode: {}",
                daemon_config.allocation.cadence,
                daemon_config.ledger.debt_mode
            );
            let scheduler = ReconcileScheduler::new(
                services.reconciler.clone(),
                daemon_config.tick_interval_secs,
            );
            scheduler.run().await?;
            tracing::info!("Aqua daemon shut down cleanly");
        }
        cmd => {
            let ctx = CommandContext {
                services,
                store,
                admin: CallerContext::admin(Principal::parse(&daemon_config.admin_principal)?),
                format: if args.json {
                    OutputFormat::Json
                } else {
                    OutputFormat::Table
                },
            };
            commands::run(cmd, &ctx).await?;
        }
    }

    Ok(())
}
