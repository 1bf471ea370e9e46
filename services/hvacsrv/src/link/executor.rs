//! Retrying request execution on the shared link
//!
//! Every link operation (polling, queued requests, control writes) goes
//! through [`RequestExecutor::execute`]: acquire the link for the device,
//! run the operation with bounded retries and linear backoff, classify and
//! count failures. Errors never reach the caller; the result is an
//! `Option` and the statistics tell the rest.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::config::LinkConfig;
use crate::error::{LinkError, LinkErrorKind};
use crate::link::arbiter::{LinkArbiter, LinkState};
use crate::stats::{FailureClass, StatsCollector, StatsSnapshot};
use crate::state::DeviceId;

/// Message fragments reported when a response belongs to another device
const CONFLICT_SIGNATURES: [&str; 3] = [
    "unexpected data",
    "expected address",
    "invalid response header",
];
const TIMEOUT_SIGNATURES: [&str; 2] = ["timed out", "timeout"];

/// One register operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read { address: u16, count: u16 },
    Write { address: u16, value: u16 },
}

impl Operation {
    pub fn read(address: u16) -> Self {
        Self::Read { address, count: 1 }
    }

    pub fn write(address: u16, value: u16) -> Self {
        Self::Write { address, value }
    }

    pub fn address(&self) -> u16 {
        match self {
            Self::Read { address, .. } | Self::Write { address, .. } => *address,
        }
    }
}

/// Successful operation result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Registers(Vec<u16>),
    Written,
}

impl Response {
    /// First register of a read response
    pub fn first_register(&self) -> Option<u16> {
        match self {
            Self::Registers(values) => values.first().copied(),
            Self::Written => None,
        }
    }
}

/// Retry budget and backoff base
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub request_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &LinkConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            request_delay: config.request_delay(),
        }
    }

    /// Pause before running attempt `attempt` (none for the first)
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            Duration::ZERO
        } else {
            self.request_delay * (attempt + 1)
        }
    }

    /// Pause after attempt `attempt` failed and another one follows
    pub fn delay_after_failure(&self, attempt: u32) -> Duration {
        self.request_delay * (attempt + 2)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&LinkConfig::default())
    }
}

/// Result of one `execute` call with the number of attempts it took
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub response: Option<Response>,
    pub attempts: u32,
}

/// Classify a link failure: structured kind first, message second.
pub fn classify(err: &LinkError) -> FailureClass {
    match err.kind {
        LinkErrorKind::Conflict => FailureClass::Conflict,
        LinkErrorKind::Timeout => FailureClass::Timeout,
        LinkErrorKind::Connection | LinkErrorKind::Other => {
            let message = err.message.to_ascii_lowercase();
            if CONFLICT_SIGNATURES.iter().any(|s| message.contains(s)) {
                FailureClass::Conflict
            } else if TIMEOUT_SIGNATURES.iter().any(|s| message.contains(s)) {
                FailureClass::Timeout
            } else {
                FailureClass::Other
            }
        },
    }
}

#[derive(Debug)]
pub struct RequestExecutor {
    arbiter: Arc<LinkArbiter>,
    stats: Arc<StatsCollector>,
    policy: RetryPolicy,
}

impl RequestExecutor {
    pub fn new(
        arbiter: Arc<LinkArbiter>,
        stats: Arc<StatsCollector>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            arbiter,
            stats,
            policy,
        }
    }

    pub fn arbiter(&self) -> &Arc<LinkArbiter> {
        &self.arbiter
    }

    pub fn stats(&self) -> &Arc<StatsCollector> {
        &self.stats
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot(self.arbiter.state())
    }

    pub fn link_state(&self) -> LinkState {
        self.arbiter.state()
    }

    pub async fn execute(
        &self,
        device: DeviceId,
        operation: Operation,
        label: &str,
    ) -> Option<Response> {
        self.execute_counted(device, operation, label)
            .await
            .response
    }

    /// Run `operation` against `device` with retries.
    pub async fn execute_counted(
        &self,
        device: DeviceId,
        operation: Operation,
        label: &str,
    ) -> Execution {
        let link = Arc::clone(self.arbiter.link());
        let mut attempts = 0;

        for attempt in 0..=self.policy.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.policy.delay_before(attempt)).await;
            }
            // Nothing may await between a confirmed acquire and the request,
            // another device can take the link during any pause
            if let Err(e) = self.arbiter.acquire(device).await {
                warn!(device = %device, "{}: could not switch link: {}", label, e);
                self.stats.record_failure(device, FailureClass::Switch);
                return Execution {
                    response: None,
                    attempts: attempts + 1,
                };
            }
            attempts += 1;

            let result = match operation {
                Operation::Read { address, count } => link
                    .read_holding_registers(address, count)
                    .await
                    .map(Response::Registers),
                Operation::Write { address, value } => link
                    .write_register(address, value)
                    .await
                    .map(|()| Response::Written),
            };

            match result {
                Ok(response) => {
                    trace!(device = %device, "{} succeeded on attempt {}", label, attempt + 1);
                    self.stats.record_success(device);
                    return Execution {
                        response: Some(response),
                        attempts,
                    };
                },
                Err(e) => {
                    let class = classify(&e);
                    self.stats.record_failure(device, class);
                    if e.is_connection() {
                        // Address must be re-sent once the link is back
                        self.arbiter.reset();
                    }

                    if attempt == self.policy.max_retries {
                        warn!(
                            device = %device,
                            "{} failed after {} attempts: {} ({:?})",
                            label, attempts, e, class
                        );
                        break;
                    }
                    debug!(
                        device = %device,
                        "{} attempt {} failed: {} ({:?}), retrying",
                        label,
                        attempt + 1,
                        e,
                        class
                    );
                    tokio::time::sleep(self.policy.delay_after_failure(attempt)).await;
                },
            }
        }

        Execution {
            response: None,
            attempts,
        }
    }

    /// Read one register; `None` when every attempt failed.
    pub async fn read_register(
        &self,
        device: DeviceId,
        address: u16,
        label: &str,
    ) -> Option<u16> {
        self.execute(device, Operation::read(address), label)
            .await
            .and_then(|response| response.first_register())
    }

    /// Write one register; `true` when some attempt succeeded.
    pub async fn write_register(
        &self,
        device: DeviceId,
        address: u16,
        value: u16,
        label: &str,
    ) -> bool {
        self.execute(device, Operation::write(address, value), label)
            .await
            .is_some()
    }
}
