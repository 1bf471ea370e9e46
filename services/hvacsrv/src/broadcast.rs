//! Downstream fan-out of finished snapshots
//!
//! Producers (poll cycle, bus aggregator, control path) only see the
//! [`Broadcaster`] trait. [`BroadcastHub`] implements it over a
//! `tokio::sync::broadcast` channel; whatever outward transport sits on top
//! subscribes and serializes the tagged [`HubEvent`]s.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::state::DeviceState;

/// Receiver of finished state
pub trait Broadcaster: Send + Sync {
    /// Whole collection, in configured order
    fn push_all(&self, devices: &[DeviceState]);

    fn push_device(&self, device: &DeviceState);

    fn push_error(&self, message: &str);
}

/// Event delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HubEvent {
    Devices {
        devices: Vec<DeviceState>,
        /// Subscribers connected when the event was produced
        clients: usize,
    },
    DeviceUpdate {
        device: DeviceState,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct BroadcastHub {
    tx: broadcast::Sender<HubEvent>,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.tx.subscribe()
    }

    pub fn client_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn send(&self, event: HubEvent) {
        // No subscribers is normal (nobody watching yet)
        if self.tx.send(event).is_err() {
            trace!("No subscribers for broadcast event");
        }
    }
}

impl Broadcaster for BroadcastHub {
    fn push_all(&self, devices: &[DeviceState]) {
        let clients = self.client_count();
        debug!("Broadcasting {} devices to {} clients", devices.len(), clients);
        self.send(HubEvent::Devices {
            devices: devices.to_vec(),
            clients,
        });
    }

    fn push_device(&self, device: &DeviceState) {
        self.send(HubEvent::DeviceUpdate {
            device: device.clone(),
        });
    }

    fn push_error(&self, message: &str) {
        self.send(HubEvent::Error {
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::DeviceId;

    #[tokio::test]
    async fn test_events_reach_subscribers() {
        let hub = BroadcastHub::new(8);
        let mut rx = hub.subscribe();
        assert_eq!(hub.client_count(), 1);

        let device = DeviceState::new(DeviceId(1), "hvac_1");
        hub.push_all(std::slice::from_ref(&device));
        hub.push_device(&device);
        hub.push_error("link down");

        match rx.recv().await.unwrap() {
            HubEvent::Devices { devices, clients } => {
                assert_eq!(devices.len(), 1);
                assert_eq!(clients, 1);
            },
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(rx.recv().await.unwrap(), HubEvent::DeviceUpdate { .. }));
        assert_eq!(
            rx.recv().await.unwrap(),
            HubEvent::Error {
                message: "link down".to_string()
            }
        );
    }

    #[test]
    fn test_push_without_subscribers_is_harmless() {
        let hub = BroadcastHub::new(4);
        hub.push_error("nobody listening");
        assert_eq!(hub.client_count(), 0);
    }

    #[test]
    fn test_event_wire_format() {
        let event = HubEvent::Error {
            message: "boom".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "error");
        assert_eq!(json["message"], "boom");

        let event = HubEvent::DeviceUpdate {
            device: DeviceState::new(DeviceId(2), "hvac_2"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "device_update");
        assert_eq!(json["device"]["id"], 2);
        assert_eq!(json["device"]["mode"], "off");
    }
}
