//! Overlay FIB manager entry point.
//!
//! Loads the configuration, wires the engine to its collaborators and runs
//! the daemon loop until SIGINT.

use clap::Parser;
use log::{error, info, warn};
use overlay_fibmgr::southbound::memory::{
    MemoryFlowProgrammer, MemoryIdManager, MemoryRoutingStore, StaticEgressResolver,
};
use overlay_fibmgr::audit::{AuditCategory, AuditRecord};
use overlay_fibmgr::{audit_log, FibConfig, FibDaemon, Southbound};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

const LABEL_RANGE: std::ops::RangeInclusive<u32> = 70_000..=100_000;
const GROUP_RANGE: std::ops::RangeInclusive<u32> = 150_000..=175_000;

/// Overlay L3VPN FIB manager
#[derive(Parser, Debug)]
#[command(name = "fibmgrd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Job worker pool size
    #[arg(short = 'w', long)]
    workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// BGP routes per batch
    #[arg(short = 'b', long)]
    batch_size: Option<usize>,

    /// BGP batch window in milliseconds
    #[arg(long)]
    batch_interval_ms: Option<u64>,

    /// Emit JSON logs instead of plain text
    #[arg(long)]
    json_logs: bool,
}

fn load_config(args: &Args) -> anyhow::Result<FibConfig> {
    let mut config = match &args.config {
        Some(path) => FibConfig::from_file(path)?,
        None => FibConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.worker_count = workers;
    }
    if let Some(batch_size) = args.batch_size {
        config.bgp_batch_size = batch_size;
    }
    if let Some(interval) = args.batch_interval_ms {
        config.bgp_batch_interval_ms = interval;
    }
    Ok(config)
}

fn memory_southbound(config: &FibConfig) -> Southbound {
    Southbound {
        store: Arc::new(MemoryRoutingStore::new()),
        flows: Arc::new(MemoryFlowProgrammer::new()),
        ids: Arc::new(
            MemoryIdManager::new()
                .with_pool(config.label_pool.clone(), LABEL_RANGE)
                .with_pool(config.group_pool.clone(), GROUP_RANGE),
        ),
        egress: Arc::new(StaticEgressResolver::new()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.json_logs {
        overlay_fibmgr::audit::init_json_logging(&args.log_level);
    } else {
        env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(&args.log_level),
        )
        .init();
    }

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(err) => {
            error!("Failed to load configuration: {:#}", err);
            return ExitCode::FAILURE;
        }
    };

    audit_log!(AuditRecord::new(
        AuditCategory::ConfigurationChange,
        "fibmgrd",
        "config_loaded"
    )
    .with_object_id(
        args.config
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "defaults".to_string())
    )
    .with_details(serde_json::json!({
        "worker_count": config.worker_count,
        "bgp_batch_size": config.bgp_batch_size,
        "bgp_batch_interval_ms": config.bgp_batch_interval_ms,
    })));

    info!("Starting overlay FIB manager");
    info!("Workers: {}", config.worker_count);
    info!(
        "BGP batch: {} routes / {}ms",
        config.bgp_batch_size, config.bgp_batch_interval_ms
    );
    info!("ID pools: {} (labels), {} (groups)", config.label_pool, config.group_pool);

    let southbound = memory_southbound(&config);
    let daemon = match FibDaemon::new(config, southbound) {
        Ok(daemon) => daemon,
        Err(err) => {
            error!("Invalid configuration: {}", err);
            return ExitCode::FAILURE;
        }
    };

    daemon
        .run(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => warn!("Received SIGINT, shutting down gracefully..."),
                Err(err) => error!("Failed to listen for ctrl-c: {}", err),
            }
        })
        .await;

    info!("Overlay FIB manager shutdown complete");
    ExitCode::SUCCESS
}
