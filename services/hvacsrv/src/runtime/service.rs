//! Service wiring
//!
//! Builds the component graph for the configured ingestion mode and spawns
//! its background tasks. Link mode runs the request queue and the poll cycle
//! over one shared [`RegisterLink`]; bus mode runs the MQTT event loop, the
//! aggregator and its debounce task. Both hand commands to a
//! [`DeviceControl`] implementation behind one [`ServiceHandle`].
//! The command server runs commands concurrently and replies in completion
//! order; replies echo device and command so clients can match them.

use std::sync::Arc;

use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broadcast::Broadcaster;
use crate::bus::{BusClient, BusEvent, BusStateAggregator, MqttBus};
use crate::command::{
    handle, CommandParser, CommandReply, CommandRequest, RESET_STATS_COMMAND, STATS_COMMAND,
};
use crate::config::{Config, ServiceMode};
use crate::control::{DeviceControl, LinkController};
use crate::error::{CommandError, Result};
use crate::link::{LinkArbiter, ModbusLink, RegisterLink, RequestExecutor, RetryPolicy};
use crate::poller::{PollCycleOrchestrator, PollTiming};
use crate::queue::RequestQueue;
use crate::registry::DeviceRegistry;
use crate::runtime::reconnect::{ReconnectHelper, ReconnectPolicy};
use crate::stats::{StatsCollector, StatsSnapshot};

/// A running service instance
pub struct ServiceHandle {
    mode: ServiceMode,
    registry: Arc<DeviceRegistry>,
    control: Arc<dyn DeviceControl>,
    parser: CommandParser,
    executor: Option<Arc<RequestExecutor>>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("mode", &self.mode)
            .field("devices", &self.registry.len())
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

impl ServiceHandle {
    pub fn mode(&self) -> ServiceMode {
        self.mode
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn control(&self) -> Arc<dyn DeviceControl> {
        Arc::clone(&self.control)
    }

    /// Link statistics; `None` in bus mode
    pub fn stats(&self) -> Option<StatsSnapshot> {
        self.executor.as_ref().map(|e| e.stats_snapshot())
    }

    pub async fn handle_command(&self, request: &CommandRequest) -> CommandReply {
        match request.command.as_str() {
            STATS_COMMAND => self.stats_command(request, false),
            RESET_STATS_COMMAND => self.stats_command(request, true),
            _ => handle(&self.parser, self.control.as_ref(), request).await,
        }
    }

    /// Report link statistics, optionally zeroing them. A reset replies with
    /// the counters as they stood before it.
    fn stats_command(&self, request: &CommandRequest, reset: bool) -> CommandReply {
        let Some(executor) = &self.executor else {
            return CommandReply::from_result(
                request,
                Err(CommandError::Rejected(format!(
                    "'{}' needs link mode, no link statistics in {:?} mode",
                    request.command, self.mode
                ))),
            );
        };

        let snapshot = executor.stats_snapshot();
        if reset {
            executor.stats().reset();
            info!(
                "Link statistics reset ({} requests, {} failed)",
                snapshot.total, snapshot.failed
            );
        }
        CommandReply {
            stats: Some(snapshot),
            ..CommandReply::from_result(request, Ok(()))
        }
    }

    /// Wait for every background task. Call after cancelling the token.
    pub async fn join(self) {
        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                if e.is_panic() {
                    error!("Service task panicked: {}", e);
                }
            }
        }
        if let Some(executor) = &self.executor {
            let stats = executor.stats_snapshot();
            info!(
                "Link statistics: {} requests, {} ok, {} failed ({} conflicts, {} timeouts), health {:?}",
                stats.total, stats.succeeded, stats.failed, stats.conflicts, stats.timeouts, stats.health
            );
        }
        info!("Service stopped");
    }
}

fn command_parser(config: &Config, registry: &DeviceRegistry) -> CommandParser {
    CommandParser::new(
        config.commands.device_prefix.clone(),
        registry.ids().iter().copied(),
    )
}

/// Start the service in the configured mode.
pub async fn start(
    config: &Config,
    broadcaster: Arc<dyn Broadcaster>,
    cancel: CancellationToken,
) -> Result<ServiceHandle> {
    info!(
        "Starting {} in {:?} mode with {} devices",
        config.service.name,
        config.service.mode,
        config.devices.len()
    );

    match config.service.mode {
        ServiceMode::Link => {
            let link = Arc::new(ModbusLink::new(&config.link));
            // The poll cycle retries with backoff; a refused first connect is not fatal
            if let Err(e) = link.connect().await {
                warn!("Initial link connection failed: {}", e);
            }
            Ok(start_link(config, link, broadcaster, cancel))
        },
        ServiceMode::Bus => {
            let (bus, events, bus_task) = MqttBus::start(&config.bus, cancel.clone());
            let mut handle = start_bus(config, Arc::new(bus), events, broadcaster, cancel).await?;
            handle.tasks.push(bus_task);
            Ok(handle)
        },
    }
}

/// Wire link mode over an already constructed link.
pub fn start_link(
    config: &Config,
    link: Arc<dyn RegisterLink>,
    broadcaster: Arc<dyn Broadcaster>,
    cancel: CancellationToken,
) -> ServiceHandle {
    let registry = Arc::new(DeviceRegistry::from_config(&config.devices, &config.bus));
    let stats = Arc::new(StatsCollector::new());
    let arbiter = Arc::new(LinkArbiter::new(link, config.link.settle_delay()));
    let executor = Arc::new(RequestExecutor::new(
        arbiter,
        stats,
        RetryPolicy::from_config(&config.link),
    ));
    let queue = Arc::new(RequestQueue::from_config(Arc::clone(&executor), &config.link));

    let poller = Arc::new(PollCycleOrchestrator::new(
        Arc::clone(&registry),
        Arc::clone(&executor),
        Arc::clone(&broadcaster),
        ReconnectHelper::new(ReconnectPolicy::from(&config.link.reconnect)),
        PollTiming::from_config(&config.link),
    ));
    let controller = Arc::new(LinkController::new(
        Arc::clone(&registry),
        Arc::clone(&queue),
        broadcaster,
        config.link.confirm_delay(),
        config.commands.power_on_mode,
    ));

    let tasks = vec![
        tokio::spawn(queue.run(cancel.clone())),
        tokio::spawn(poller.run(cancel)),
    ];

    ServiceHandle {
        mode: ServiceMode::Link,
        parser: command_parser(config, &registry),
        registry,
        control: controller,
        executor: Some(executor),
        tasks,
    }
}

/// Wire bus mode over an already constructed bus client and its event stream.
pub async fn start_bus(
    config: &Config,
    bus: Arc<dyn BusClient>,
    events: mpsc::Receiver<BusEvent>,
    broadcaster: Arc<dyn Broadcaster>,
    cancel: CancellationToken,
) -> Result<ServiceHandle> {
    let registry = Arc::new(DeviceRegistry::from_config(&config.devices, &config.bus));
    let (aggregator, debounce_task) = BusStateAggregator::new(
        Arc::clone(&registry),
        bus,
        broadcaster,
        &config.bus,
        config.commands.power_on_mode,
        cancel.clone(),
    );
    aggregator.subscribe_all().await?;

    let tasks = vec![
        debounce_task,
        tokio::spawn(Arc::clone(&aggregator).run(events, cancel)),
    ];

    Ok(ServiceHandle {
        mode: ServiceMode::Bus,
        parser: command_parser(config, &registry),
        registry,
        control: aggregator,
        executor: None,
        tasks,
    })
}

/// Read JSON-line commands and write one JSON-line reply per command.
///
/// Commands run concurrently, so a slow confirmed write does not hold up the
/// lines behind it. Returns once the input has ended and every accepted
/// command has replied, or when the token is cancelled.
pub async fn serve_commands<R, W>(
    handle: &ServiceHandle,
    reader: R,
    mut writer: W,
    cancel: CancellationToken,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    let mut in_flight = FuturesUnordered::new();
    let mut input_open = true;

    while input_open || !in_flight.is_empty() {
        tokio::select! {
            _ = cancel.cancelled() => {
                if !in_flight.is_empty() {
                    debug!("Dropping {} unfinished commands", in_flight.len());
                }
                break;
            },
            Some(reply) = in_flight.next(), if !in_flight.is_empty() => {
                write_reply(&mut writer, &reply).await?;
            },
            line = lines.next_line(), if input_open => {
                let Some(line) = line? else {
                    debug!("Command input closed");
                    input_open = false;
                    continue;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                match serde_json::from_str::<CommandRequest>(line) {
                    Ok(request) => {
                        in_flight.push(async move { handle.handle_command(&request).await });
                    },
                    Err(e) => {
                        warn!("Malformed command '{}': {}", line, e);
                        let reply = CommandReply {
                            device: String::new(),
                            command: String::new(),
                            success: false,
                            error: Some(format!("command rejected: malformed request: {}", e)),
                            stats: None,
                        };
                        write_reply(&mut writer, &reply).await?;
                    },
                }
            },
        }
    }
    Ok(())
}

async fn write_reply<W>(writer: &mut W, reply: &CommandReply) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut encoded = serde_json::to_vec(reply)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}
