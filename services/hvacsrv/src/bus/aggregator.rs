//! Bus state aggregation
//!
//! Maps every telemetry topic of every configured device to one field,
//! decodes incoming payloads with the same rules as the register path and
//! merges them into the registry. A burst of updates produces one downstream
//! push once the bus has been quiet for the debounce window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::Broadcaster;
use crate::bus::client::{BusClient, BusEvent};
use crate::bus::debounce::Debouncer;
use crate::config::BusConfig;
use crate::control::{
    mode_register_value, power_on_target, validate_fan_speed, validate_setpoint, DeviceControl,
};
use crate::error::{BusError, CommandError};
use crate::registry::DeviceRegistry;
use crate::state::{decode_payload, DeviceId, OperatingMode, Parameter};

pub struct BusStateAggregator {
    registry: Arc<DeviceRegistry>,
    bus: Arc<dyn BusClient>,
    broadcaster: Arc<dyn Broadcaster>,
    routes: HashMap<String, (DeviceId, Parameter)>,
    debouncer: Debouncer,
    command_settle: Duration,
    power_on_mode: OperatingMode,
}

impl std::fmt::Debug for BusStateAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusStateAggregator")
            .field("topics", &self.routes.len())
            .field("command_settle", &self.command_settle)
            .finish()
    }
}

impl BusStateAggregator {
    /// Build the topic routes and spawn the debounce task.
    pub fn new(
        registry: Arc<DeviceRegistry>,
        bus: Arc<dyn BusClient>,
        broadcaster: Arc<dyn Broadcaster>,
        config: &BusConfig,
        power_on_mode: OperatingMode,
        cancel: CancellationToken,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let mut routes = HashMap::new();
        for &id in registry.ids() {
            if let Some(spec) = registry.spec(id) {
                for (parameter, topic) in spec.topics.telemetry_topics() {
                    routes.insert(topic.to_string(), (id, parameter));
                }
            }
        }

        let flush = {
            let registry = Arc::clone(&registry);
            let broadcaster = Arc::clone(&broadcaster);
            move || broadcaster.push_all(&registry.snapshot())
        };
        let (debouncer, task) = Debouncer::spawn(config.debounce(), flush, cancel);

        let aggregator = Arc::new(Self {
            registry,
            bus,
            broadcaster,
            routes,
            debouncer,
            command_settle: config.command_settle(),
            power_on_mode,
        });
        (aggregator, task)
    }

    /// Subscribe to every telemetry topic.
    pub async fn subscribe_all(&self) -> Result<usize, BusError> {
        let mut topics: Vec<&String> = self.routes.keys().collect();
        topics.sort();
        for topic in &topics {
            self.bus.subscribe(topic).await?;
        }
        info!("Subscribed to {} telemetry topics", topics.len());
        Ok(topics.len())
    }

    /// Apply one telemetry message. Returns false when it was ignored.
    pub fn handle_message(&self, topic: &str, payload: &str) -> bool {
        let Some(&(device, parameter)) = self.routes.get(topic) else {
            debug!("Ignoring message on unmapped topic {}", topic);
            return false;
        };

        let update = match decode_payload(parameter, payload) {
            Ok(update) => update,
            Err(e) => {
                warn!(device = %device, "{}", e);
                return false;
            },
        };

        if self.registry.apply(device, update).is_none() {
            return false;
        }
        self.debouncer.touch();
        true
    }

    /// Consume bus events until cancelled or the stream ends.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<BusEvent>, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Some(BusEvent::Message { topic, payload }) => {
                    self.handle_message(&topic, &payload);
                },
                Some(BusEvent::Connected) => info!("Bus connected"),
                Some(BusEvent::Disconnected(reason)) => {
                    warn!("Bus connection lost: {}", reason);
                    self.broadcaster
                        .push_error(&format!("bus connection lost: {}", reason));
                },
                None => {
                    warn!("Bus event stream closed");
                    break;
                },
            }
        }
        debug!("Bus aggregator stopped");
    }

    async fn command(
        &self,
        device: DeviceId,
        parameter: Parameter,
        value: u16,
    ) -> Result<(), CommandError> {
        let spec = self
            .registry
            .spec(device)
            .ok_or_else(|| CommandError::UnknownDevice(device.to_string()))?;
        let topic = spec.topics.command(parameter).ok_or_else(|| {
            CommandError::Rejected(format!("no command topic for {} on device {}", parameter, device))
        })?;

        self.bus.publish(topic, &value.to_string()).await?;
        info!(device = %device, "Published {} = {} to {}", parameter, value, topic);

        tokio::time::sleep(self.command_settle).await;
        self.debouncer.flush_now();
        Ok(())
    }
}

#[async_trait]
impl DeviceControl for BusStateAggregator {
    async fn set_power(&self, device: DeviceId, on: bool) -> Result<(), CommandError> {
        let mode = if on {
            power_on_target(&self.registry, device, self.power_on_mode)
        } else {
            OperatingMode::Off
        };
        self.set_mode(device, mode).await
    }

    async fn set_temperature_setpoint(
        &self,
        device: DeviceId,
        value: i32,
    ) -> Result<(), CommandError> {
        let raw = validate_setpoint(value)?;
        self.command(device, Parameter::Setpoint, raw).await
    }

    async fn set_fan_speed(&self, device: DeviceId, value: i32) -> Result<(), CommandError> {
        let raw = validate_fan_speed(value)?;
        self.command(device, Parameter::FanSpeed, raw).await
    }

    async fn set_mode(&self, device: DeviceId, mode: OperatingMode) -> Result<(), CommandError> {
        let raw = mode_register_value(mode)?;
        self.command(device, Parameter::Mode, raw).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceConfig, RegisterMap};
    use crate::test_utils::{MockBus, RecordingBroadcaster};
    use tokio::time::Instant;

    struct Fixture {
        bus: Arc<MockBus>,
        registry: Arc<DeviceRegistry>,
        broadcaster: Arc<RecordingBroadcaster>,
        aggregator: Arc<BusStateAggregator>,
        cancel: CancellationToken,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    fn fixture(ids: &[u8]) -> Fixture {
        let devices: Vec<_> = ids
            .iter()
            .map(|id| DeviceConfig {
                id: *id,
                name: None,
                registers: RegisterMap::default(),
                topics: Vec::new(),
            })
            .collect();
        let config = BusConfig::default();
        let registry = Arc::new(DeviceRegistry::from_config(&devices, &config));
        let bus = Arc::new(MockBus::new());
        let broadcaster = Arc::new(RecordingBroadcaster::new());
        let cancel = CancellationToken::new();
        let (aggregator, _debounce) = BusStateAggregator::new(
            Arc::clone(&registry),
            Arc::clone(&bus) as Arc<dyn BusClient>,
            Arc::clone(&broadcaster) as Arc<dyn Broadcaster>,
            &config,
            OperatingMode::Cool,
            cancel.clone(),
        );
        Fixture {
            bus,
            registry,
            broadcaster,
            aggregator,
            cancel,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribes_every_device_parameter() {
        let f = fixture(&[1, 2]);
        assert_eq!(f.aggregator.subscribe_all().await.unwrap(), 14);
        let subscriptions = f.bus.subscriptions();
        assert!(subscriptions.contains(&"hvac/1/air_temperature".to_string()));
        assert!(subscriptions.contains(&"hvac/2/valve".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_decode_into_registry() {
        let f = fixture(&[1]);
        assert!(f.aggregator.handle_message("hvac/1/air_temperature", "84"));
        assert!(f.aggregator.handle_message("hvac/1/valve", "512"));
        assert!(f.aggregator.handle_message("hvac/1/pump", "1"));
        assert!(f.aggregator.handle_message("hvac/1/mode", "2"));

        let state = f.registry.get(DeviceId(1)).unwrap();
        assert!(state.online);
        assert_eq!(state.air_temperature, 22.0);
        assert!(state.valve_open);
        assert!(state.pump_running);
        assert_eq!(state.mode, OperatingMode::Heat);
        assert!(state.power);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_payload_and_unknown_topic_ignored() {
        let f = fixture(&[1]);
        assert!(!f.aggregator.handle_message("hvac/1/setpoint", "warm"));
        assert!(!f.aggregator.handle_message("hvac/9/setpoint", "22"));

        let state = f.registry.get(DeviceId(1)).unwrap();
        assert!(!state.online);
        assert_eq!(state.setpoint, 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(f.broadcaster.full_pushes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_produces_single_push() {
        let f = fixture(&[1, 2]);
        for value in 20..25 {
            f.aggregator
                .handle_message("hvac/1/setpoint", &value.to_string());
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        f.aggregator.handle_message("hvac/2/fan_speed", "3");
        assert!(f.broadcaster.full_pushes().is_empty());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let pushes = f.broadcaster.full_pushes();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0][0].setpoint, 24);
        assert_eq!(pushes[0][1].fan_speed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_publishes_then_forces_flush() {
        let f = fixture(&[1]);

        let start = Instant::now();
        f.aggregator
            .set_temperature_setpoint(DeviceId(1), 22)
            .await
            .unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(500));
        assert_eq!(
            f.bus.published(),
            vec![("hvac/1/set/setpoint".to_string(), "22".to_string())]
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.broadcaster.full_pushes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_validation_and_bus_errors() {
        let f = fixture(&[1]);
        let err = f
            .aggregator
            .set_fan_speed(DeviceId(1), 9)
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Validation { .. }));
        assert!(f.bus.published().is_empty());

        f.bus.set_connected(false);
        let err = f
            .aggregator
            .set_power(DeviceId(1), true)
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::Bus(BusError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_publishes_mode_code() {
        let f = fixture(&[1]);
        f.aggregator.handle_message("hvac/1/mode", "3");
        f.aggregator.set_power(DeviceId(1), false).await.unwrap();
        f.aggregator.set_power(DeviceId(1), true).await.unwrap();

        let payloads: Vec<_> = f.bus.published().into_iter().map(|(_, p)| p).collect();
        assert_eq!(payloads, vec!["0".to_string(), "3".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_consumes_events_and_reports_loss() {
        let f = fixture(&[1]);
        let (tx, rx) = mpsc::channel(8);
        let runner = tokio::spawn(Arc::clone(&f.aggregator).run(rx, f.cancel.clone()));

        tx.send(BusEvent::Connected).await.unwrap();
        tx.send(BusEvent::Message {
            topic: "hvac/1/setpoint".to_string(),
            payload: "21".to_string(),
        })
        .await
        .unwrap();
        tx.send(BusEvent::Disconnected("keep-alive timeout".to_string()))
            .await
            .unwrap();
        drop(tx);
        runner.await.unwrap();

        assert_eq!(f.registry.get(DeviceId(1)).unwrap().setpoint, 21);
        assert_eq!(
            f.broadcaster.errors(),
            vec!["bus connection lost: keep-alive timeout".to_string()]
        );
    }
}
