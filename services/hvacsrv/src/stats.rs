//! Link request statistics
//!
//! Counters are monotonic until an explicit [`StatsCollector::reset`].

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use crate::link::arbiter::LinkState;
use crate::state::DeviceId;

const NO_DEVICE: u8 = 0;

/// Success rate at or above which the link counts as healthy
pub const HEALTHY_THRESHOLD: f64 = 0.95;
/// Success rate at or above which the link counts as degraded
pub const DEGRADED_THRESHOLD: f64 = 0.80;

/// Why an attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Response from the wrong device
    Conflict,
    Timeout,
    /// Any other protocol failure
    Other,
    /// The arbiter could not switch the link to the device
    Switch,
}

/// Link health derived from the success rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    /// Nothing attempted yet
    Idle,
    Healthy,
    Degraded,
    Unhealthy,
}

/// Point-in-time copy of the counters plus derived rates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub conflicts: u64,
    pub timeouts: u64,
    pub active_device: Option<DeviceId>,
    pub link_state: String,
    pub success_rate: f64,
    pub conflict_rate: f64,
    pub timeout_rate: f64,
    pub health: Health,
}

#[derive(Debug, Default)]
pub struct StatsCollector {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    conflicts: AtomicU64,
    timeouts: AtomicU64,
    /// Address of the device last handed the link, `NO_DEVICE` when none
    last_device: AtomicU8,
    has_device: AtomicBool,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, device: DeviceId) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.observe_device(device);
    }

    pub fn record_failure(&self, device: DeviceId, class: FailureClass) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
        match class {
            FailureClass::Conflict => {
                self.conflicts.fetch_add(1, Ordering::Relaxed);
            },
            FailureClass::Timeout => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
            },
            FailureClass::Other | FailureClass::Switch => {},
        }
        if class != FailureClass::Switch {
            self.observe_device(device);
        }
    }

    fn observe_device(&self, device: DeviceId) {
        self.last_device.store(device.address(), Ordering::Relaxed);
        self.has_device.store(true, Ordering::Relaxed);
    }

    pub fn last_device(&self) -> Option<DeviceId> {
        self.has_device
            .load(Ordering::Relaxed)
            .then(|| DeviceId(self.last_device.load(Ordering::Relaxed)))
    }

    pub fn snapshot(&self, link_state: LinkState) -> StatsSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let succeeded = self.succeeded.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let conflicts = self.conflicts.load(Ordering::Relaxed);
        let timeouts = self.timeouts.load(Ordering::Relaxed);

        let rate = |count: u64| {
            if total == 0 {
                0.0
            } else {
                count as f64 / total as f64
            }
        };
        let success_rate = rate(succeeded);
        let health = if total == 0 {
            Health::Idle
        } else if success_rate >= HEALTHY_THRESHOLD {
            Health::Healthy
        } else if success_rate >= DEGRADED_THRESHOLD {
            Health::Degraded
        } else {
            Health::Unhealthy
        };

        StatsSnapshot {
            total,
            succeeded,
            failed,
            conflicts,
            timeouts,
            active_device: link_state.active_device().or_else(|| self.last_device()),
            link_state: link_state.to_string(),
            success_rate,
            conflict_rate: rate(conflicts),
            timeout_rate: rate(timeouts),
            health,
        }
    }

    /// Operator reset of every counter
    pub fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.succeeded.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.conflicts.store(0, Ordering::Relaxed);
        self.timeouts.store(0, Ordering::Relaxed);
        self.last_device.store(NO_DEVICE, Ordering::Relaxed);
        self.has_device.store(false, Ordering::Relaxed);
    }
}
