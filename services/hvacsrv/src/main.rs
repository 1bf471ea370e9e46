//! HVAC fleet state service
//!
//! Loads configuration, starts the configured ingestion mode and serves
//! JSON-line commands on stdin. Hub events are written to stdout as JSON
//! lines for whatever transport fronts the process.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use common::{wait_for_shutdown, LogConfig};
use hvacsrv::config::DEFAULT_CONFIG_PATH;
use hvacsrv::runtime::{self, serve_commands};
use hvacsrv::{BroadcastHub, Config, HubEvent, ServiceMode};

/// Command-line arguments for hvacsrv
#[derive(Parser, Debug, Clone)]
#[command(
    name = "hvacsrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "HVAC fleet state service",
    long_about = None
)]
struct Args {
    /// Configuration file (YAML)
    #[arg(short = 'c', long, env = "HVACSRV_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// Validation mode - only validate configuration without starting service
    #[arg(long)]
    validate: bool,

    /// Ingestion mode; overrides the config file
    #[arg(short = 'm', long, value_enum)]
    mode: Option<ServiceMode>,
}

async fn forward_events(hub: Arc<BroadcastHub>, cancel: CancellationToken) {
    let mut events = hub.subscribe();
    let mut stdout = tokio::io::stdout();

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        let event: HubEvent = match event {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Event output lagging, {} events skipped", skipped);
                continue;
            },
            Err(RecvError::Closed) => break,
        };

        let mut line = match serde_json::to_vec(&event) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to encode event: {}", e);
                continue;
            },
        };
        line.push(b'\n');
        if let Err(e) = stdout.write_all(&line).await {
            error!("Failed to write event: {}", e);
            break;
        }
        let _ = stdout.flush().await;
    }
    debug!("Event output stopped");
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    if let Some(mode) = args.mode {
        config.service.mode = mode;
    }

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let mut log_config = LogConfig::new(config.service.name.clone(), level);
    if let Some(dir) = &config.logging.dir {
        log_config = log_config.with_log_dir(dir);
    }
    let _log_guard = common::logging::init(&log_config)?;

    config.validate()?;
    if args.validate {
        info!(
            "Configuration valid: {} devices, {:?} mode",
            config.devices.len(),
            config.service.mode
        );
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let hub = Arc::new(BroadcastHub::new(config.service.broadcast_capacity));
    let output = tokio::spawn(forward_events(Arc::clone(&hub), cancel.clone()));

    let handle = runtime::start(&config, hub, cancel.clone()).await?;
    info!("hvacsrv running, reading commands from stdin");

    {
        let commands = serve_commands(
            &handle,
            BufReader::new(tokio::io::stdin()),
            tokio::io::stdout(),
            cancel.clone(),
        );
        tokio::pin!(commands);
        let shutdown = wait_for_shutdown();
        tokio::pin!(shutdown);
        let mut commands_open = true;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                },
                result = &mut commands, if commands_open => {
                    commands_open = false;
                    match result {
                        Ok(()) => info!("Command input closed, service keeps running"),
                        Err(e) => error!("Command input failed: {}", e),
                    }
                },
            }
        }
    }

    cancel.cancel();
    handle.join().await;
    let _ = output.await;
    Ok(())
}
