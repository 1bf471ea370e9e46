//! Periodic poll cycle over the shared link
//!
//! One cycle visits every configured device in order: a short availability
//! probe, then one read per register through the retrying executor, then the
//! assembled state goes into the registry. A device that fails is marked
//! offline and the cycle moves on. The whole collection is broadcast once at
//! the end. Triggers that arrive while a cycle is running are dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::Broadcaster;
use crate::config::LinkConfig;
use crate::link::client::RegisterLink;
use crate::link::executor::RequestExecutor;
use crate::registry::{DeviceRegistry, DeviceSpec};
use crate::runtime::reconnect::ReconnectHelper;
use crate::state::{DeviceId, DeviceState, RawReadings};

/// Pacing of one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTiming {
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub inter_request_delay: Duration,
    pub inter_device_delay: Duration,
}

impl PollTiming {
    pub fn from_config(config: &LinkConfig) -> Self {
        Self {
            interval: config.poll_interval(),
            probe_timeout: config.probe_timeout(),
            inter_request_delay: config.inter_request_delay(),
            inter_device_delay: config.inter_device_delay(),
        }
    }
}

/// How a poll trigger ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed { online: usize, offline: usize },
    /// A cycle was already running
    Skipped,
    /// The link could not be (re)established; every device is offline
    LinkDown,
}

/// Why a device was marked offline this cycle
#[derive(Debug, Error)]
enum DeviceFault {
    #[error("not configured")]
    Unknown,
    #[error("no answer to availability probe")]
    ProbeFailed,
    #[error("link lost while polling")]
    LinkLost,
}

/// Clears the polling flag when the cycle ends, however it ends
struct PollingGuard<'a>(&'a AtomicBool);

impl Drop for PollingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct PollCycleOrchestrator {
    registry: Arc<DeviceRegistry>,
    executor: Arc<RequestExecutor>,
    broadcaster: Arc<dyn Broadcaster>,
    reconnect: Mutex<ReconnectHelper>,
    timing: PollTiming,
    polling: AtomicBool,
}

impl std::fmt::Debug for PollCycleOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollCycleOrchestrator")
            .field("devices", &self.registry.len())
            .field("timing", &self.timing)
            .field("polling", &self.is_polling())
            .finish()
    }
}

impl PollCycleOrchestrator {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        executor: Arc<RequestExecutor>,
        broadcaster: Arc<dyn Broadcaster>,
        reconnect: ReconnectHelper,
        timing: PollTiming,
    ) -> Self {
        Self {
            registry,
            executor,
            broadcaster,
            reconnect: Mutex::new(reconnect),
            timing,
            polling: AtomicBool::new(false),
        }
    }

    pub fn is_polling(&self) -> bool {
        self.polling.load(Ordering::Acquire)
    }

    fn link(&self) -> Arc<dyn RegisterLink> {
        Arc::clone(self.executor.arbiter().link())
    }

    /// Run one cycle unless one is already in progress.
    pub async fn poll_once(&self) -> CycleOutcome {
        if self
            .polling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Poll cycle already running, trigger dropped");
            return CycleOutcome::Skipped;
        }
        let _guard = PollingGuard(&self.polling);

        if !self.ensure_link().await {
            return CycleOutcome::LinkDown;
        }

        let mut online = 0;
        let mut offline = 0;
        for &id in self.registry.ids() {
            match self.poll_device(id).await {
                Ok(state) => {
                    self.registry.replace(state);
                    online += 1;
                },
                Err(fault) => {
                    warn!(device = %id, "Device offline: {}", fault);
                    self.registry.mark_offline(id);
                    offline += 1;
                },
            }
            tokio::time::sleep(self.timing.inter_device_delay).await;
        }

        self.broadcaster.push_all(&self.registry.snapshot());
        let stats = self.executor.stats_snapshot();
        debug!(
            "Poll cycle complete: {} online, {} offline; link {} requests, {:.0}% ok, health {:?}",
            online,
            offline,
            stats.total,
            stats.success_rate * 100.0,
            stats.health
        );
        CycleOutcome::Completed { online, offline }
    }

    /// Reconnect if needed; on failure every device goes offline.
    async fn ensure_link(&self) -> bool {
        let link = self.link();
        let connected = link.is_connected();
        let result = {
            let mut helper = self.reconnect.lock().await;
            helper
                .ensure_connected(connected, || {
                    let link = Arc::clone(&link);
                    async move { link.reconnect().await }
                })
                .await
        };

        match result {
            Ok(()) => {
                if !connected {
                    // A fresh connection has no address selected yet
                    self.executor.arbiter().reset();
                }
                true
            },
            Err(e) => {
                warn!("Link unavailable: {}", e);
                self.registry.mark_all_offline();
                self.broadcaster.push_all(&self.registry.snapshot());
                self.broadcaster
                    .push_error(&format!("link unavailable: {}", e));
                false
            },
        }
    }

    async fn probe(&self, spec: &DeviceSpec) -> bool {
        let link = self.link();
        let probe = async {
            self.executor.arbiter().acquire(spec.id).await.ok()?;
            link.read_holding_registers(spec.registers.mode, 1).await.ok()
        };
        matches!(
            tokio::time::timeout(self.timing.probe_timeout, probe).await,
            Ok(Some(_))
        )
    }

    async fn read(&self, id: DeviceId, address: u16, label: &str) -> Option<u16> {
        let value = self.executor.read_register(id, address, label).await;
        tokio::time::sleep(self.timing.inter_request_delay).await;
        value
    }

    async fn poll_device(&self, id: DeviceId) -> Result<DeviceState, DeviceFault> {
        let spec = self.registry.spec(id).ok_or(DeviceFault::Unknown)?;
        if !self.probe(&spec).await {
            return Err(DeviceFault::ProbeFailed);
        }

        let registers = spec.registers;
        let mut readings = RawReadings {
            mode: self.read(id, registers.mode, "mode").await,
            setpoint: self.read(id, registers.setpoint, "setpoint").await,
            fan_speed: self.read(id, registers.fan_speed, "fan speed").await,
            air_temperature: self.read(id, registers.air_temperature, "air temperature").await,
            water_temperature: self
                .read(id, registers.water_temperature, "water temperature")
                .await,
            pump_status: self.read(id, registers.pump_status, "pump status").await,
            valve_status: self.read(id, registers.valve_status, "valve status").await,
            error_status: self.read(id, registers.error_status, "error status").await,
            protection: None,
        };
        readings.protection = if registers.protection_shares_error_word() {
            readings.error_status
        } else {
            self.read(id, registers.protection, "protection").await
        };

        if !self.link().is_connected() {
            return Err(DeviceFault::LinkLost);
        }
        Ok(DeviceState::from_readings(id, spec.name.clone(), &readings))
    }

    /// Trigger a cycle every interval until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.timing.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            "Polling {} devices every {:?}",
            self.registry.len(),
            self.timing.interval
        );

        let mut current: Option<tokio::task::JoinHandle<CycleOutcome>> = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let orchestrator = Arc::clone(&self);
                    current = Some(tokio::spawn(async move { orchestrator.poll_once().await }));
                }
            }
        }

        if let Some(cycle) = current {
            cycle.abort();
        }
        info!("Polling stopped");
    }
}
