//! Link address arbitration
//!
//! Only one device is addressed on the shared link at a time. Switching the
//! active address is serialized: while one switch is in flight every other
//! acquisition fails immediately instead of queueing behind it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::ArbiterError;
use crate::link::client::RegisterLink;
use crate::state::DeviceId;

/// Ownership state of the shared link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    /// No device addressed yet (startup, or after a failed switch)
    #[default]
    Idle,
    /// Address change in flight
    Switching { to: DeviceId },
    /// Requests go to this device
    Active(DeviceId),
}

impl LinkState {
    pub fn active_device(&self) -> Option<DeviceId> {
        match self {
            Self::Active(device) => Some(*device),
            _ => None,
        }
    }

    pub fn is_switching(&self) -> bool {
        matches!(self, Self::Switching { .. })
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Switching { to } => write!(f, "switching({})", to),
            Self::Active(device) => write!(f, "active({})", device),
        }
    }
}

/// Serializes address switches on the shared link
pub struct LinkArbiter {
    link: Arc<dyn RegisterLink>,
    state: Mutex<LinkState>,
    settle_delay: Duration,
}

impl fmt::Debug for LinkArbiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkArbiter")
            .field("state", &self.state())
            .field("settle_delay", &self.settle_delay)
            .finish()
    }
}

/// Returns the arbiter to `Idle` unless the switch completed.
struct SwitchGuard<'a> {
    state: &'a Mutex<LinkState>,
    completed: bool,
}

impl Drop for SwitchGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            *self.state.lock() = LinkState::Idle;
        }
    }
}

impl LinkArbiter {
    pub fn new(link: Arc<dyn RegisterLink>, settle_delay: Duration) -> Self {
        Self {
            link,
            state: Mutex::new(LinkState::Idle),
            settle_delay,
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock()
    }

    pub fn active_device(&self) -> Option<DeviceId> {
        self.state().active_device()
    }

    pub fn link(&self) -> &Arc<dyn RegisterLink> {
        &self.link
    }

    /// Make `device` the active link address.
    pub async fn acquire(&self, device: DeviceId) -> Result<(), ArbiterError> {
        {
            let mut state = self.state.lock();
            match *state {
                LinkState::Switching { to } => {
                    debug!(device = %device, "Link busy switching to {}", to);
                    return Err(ArbiterError::Busy {
                        requested: device,
                        switching_to: to,
                    });
                },
                LinkState::Active(active) if active == device => return Ok(()),
                _ => *state = LinkState::Switching { to: device },
            }
        }

        let mut guard = SwitchGuard {
            state: &self.state,
            completed: false,
        };

        if let Err(source) = self.link.set_active_address(device.address()).await {
            warn!(device = %device, "Address switch failed: {}", source);
            return Err(ArbiterError::Switch { device, source });
        }
        tokio::time::sleep(self.settle_delay).await;

        *self.state.lock() = LinkState::Active(device);
        guard.completed = true;
        debug!(device = %device, "Link switched");
        Ok(())
    }

    /// Forget the active device so the next acquisition switches again.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        if !state.is_switching() {
            *state = LinkState::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ScriptedLink;
    use tokio::time::Instant;

    fn arbiter(link: &Arc<ScriptedLink>) -> Arc<LinkArbiter> {
        Arc::new(LinkArbiter::new(
            Arc::clone(link) as Arc<dyn RegisterLink>,
            Duration::from_millis(200),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_waits_settle_delay() {
        let link = Arc::new(ScriptedLink::new());
        let arbiter = arbiter(&link);

        let start = Instant::now();
        arbiter.acquire(DeviceId(1)).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(200));
        assert_eq!(arbiter.state(), LinkState::Active(DeviceId(1)));
        assert_eq!(link.active_address(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_device_needs_no_switch() {
        let link = Arc::new(ScriptedLink::new());
        let arbiter = arbiter(&link);
        arbiter.acquire(DeviceId(1)).await.unwrap();

        let start = Instant::now();
        arbiter.acquire(DeviceId(1)).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(link.address_switches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquire_fails_fast_while_switching() {
        let link = Arc::new(ScriptedLink::new());
        let arbiter = arbiter(&link);

        let first = tokio::spawn({
            let arbiter = Arc::clone(&arbiter);
            async move { arbiter.acquire(DeviceId(1)).await }
        });
        // Let the first acquisition enter its settle delay
        tokio::task::yield_now().await;
        assert_eq!(arbiter.state(), LinkState::Switching { to: DeviceId(1) });

        let start = Instant::now();
        let err = arbiter.acquire(DeviceId(2)).await.unwrap_err();
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(
            err,
            ArbiterError::Busy {
                requested: DeviceId(2),
                switching_to: DeviceId(1),
            }
        );

        first.await.unwrap().unwrap();
        assert_eq!(arbiter.state(), LinkState::Active(DeviceId(1)));
        assert_eq!(link.address_switches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_switch_returns_to_idle() {
        let link = Arc::new(ScriptedLink::new());
        link.set_connected(false);
        let arbiter = arbiter(&link);

        let err = arbiter.acquire(DeviceId(4)).await.unwrap_err();
        assert!(matches!(err, ArbiterError::Switch { device, .. } if device == DeviceId(4)));
        assert_eq!(arbiter.state(), LinkState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_switch_returns_to_idle() {
        let link = Arc::new(ScriptedLink::new());
        let arbiter = arbiter(&link);

        let pending = tokio::spawn({
            let arbiter = Arc::clone(&arbiter);
            async move { arbiter.acquire(DeviceId(3)).await }
        });
        tokio::task::yield_now().await;
        pending.abort();
        let _ = pending.await;

        assert_eq!(arbiter.state(), LinkState::Idle);
    }
}
