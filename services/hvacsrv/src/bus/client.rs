//! Publish/subscribe bus client
//!
//! [`MqttBus`] wraps a `rumqttc` client. Its event loop runs in a background
//! task and forwards incoming publishes and connection changes as
//! [`BusEvent`]s over an mpsc channel. Topics are re-subscribed on every
//! ConnAck since the broker session does not survive a reconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BusConfig;
use crate::error::BusError;

/// Operations the aggregator needs from the bus
#[async_trait]
pub trait BusClient: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<(), BusError>;

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BusError>;

    fn is_connected(&self) -> bool;
}

/// Inbound traffic and connection changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Message { topic: String, payload: String },
    Connected,
    Disconnected(String),
}

/// `rumqttc` backed bus client
#[derive(Clone)]
pub struct MqttBus {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    topics: Arc<Mutex<Vec<String>>>,
}

impl std::fmt::Debug for MqttBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttBus")
            .field("connected", &self.is_connected())
            .field("topics", &self.topics.lock().len())
            .finish()
    }
}

pub fn mqtt_options(config: &BusConfig) -> MqttOptions {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
    options.set_clean_session(true);
    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        options.set_credentials(username, password);
    }
    options
}

impl MqttBus {
    /// Create the client and spawn its event loop.
    pub fn start(
        config: &BusConfig,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<BusEvent>, JoinHandle<()>) {
        let capacity = config.channel_capacity.max(1);
        let (client, eventloop) = AsyncClient::new(mqtt_options(config), capacity);
        let (tx, rx) = mpsc::channel(capacity);

        let bus = Self {
            client,
            connected: Arc::new(AtomicBool::new(false)),
            topics: Arc::new(Mutex::new(Vec::new())),
        };

        info!("Connecting to MQTT broker {}:{}", config.host, config.port);
        let task = tokio::spawn(bus.clone().drive(
            eventloop,
            tx,
            config.reconnect_delay(),
            config.max_reconnect_attempts,
            cancel,
        ));
        (bus, rx, task)
    }

    fn resubscribe(&self) {
        for topic in self.topics.lock().iter() {
            if let Err(e) = self.client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                warn!("Failed to resubscribe to {}: {}", topic, e);
            }
        }
    }

    async fn drive(
        self,
        mut eventloop: EventLoop,
        tx: mpsc::Sender<BusEvent>,
        reconnect_delay: Duration,
        max_failures: u32,
        cancel: CancellationToken,
    ) {
        let mut failures = 0u32;

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = eventloop.poll() => event,
            };

            let forward = match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    failures = 0;
                    self.connected.store(true, Ordering::Release);
                    info!("Connected to MQTT broker");
                    self.resubscribe();
                    Some(BusEvent::Connected)
                },
                Ok(Event::Incoming(Packet::Publish(publish))) => Some(BusEvent::Message {
                    topic: publish.topic.clone(),
                    payload: String::from_utf8_lossy(&publish.payload).into_owned(),
                }),
                Ok(_) => None,
                Err(e) => {
                    let was_connected = self.connected.swap(false, Ordering::AcqRel);
                    failures += 1;
                    warn!("MQTT connection error ({} in a row): {}", failures, e);

                    if max_failures > 0 && failures >= max_failures {
                        error!("Giving up on MQTT broker after {} failures", failures);
                        let _ = tx.send(BusEvent::Disconnected(e.to_string())).await;
                        break;
                    }

                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(reconnect_delay) => {},
                    }
                    was_connected.then(|| BusEvent::Disconnected(e.to_string()))
                },
            };

            if let Some(event) = forward {
                if tx.send(event).await.is_err() {
                    debug!("Bus event receiver dropped, stopping event loop");
                    break;
                }
            }
        }

        self.connected.store(false, Ordering::Release);
        debug!("MQTT event loop stopped");
    }
}

#[async_trait]
impl BusClient for MqttBus {
    async fn subscribe(&self, topic: &str) -> Result<(), BusError> {
        {
            let mut topics = self.topics.lock();
            if !topics.iter().any(|t| t == topic) {
                topics.push(topic.to_string());
            }
        }
        // Before the first ConnAck the topic is picked up by `resubscribe`
        if !self.is_connected() {
            return Ok(());
        }
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| BusError::Client(e.to_string()))
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        debug!("Publishing '{}' to {}", payload, topic);
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload.as_bytes().to_vec())
            .await
            .map_err(|e| BusError::Client(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_from_config() {
        let config = BusConfig {
            host: "broker.local".to_string(),
            port: 1884,
            client_id: "hvacsrv-test".to_string(),
            username: Some("user".to_string()),
            password: Some("secret".to_string()),
            ..BusConfig::default()
        };
        let options = mqtt_options(&config);
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1884));
        assert_eq!(options.client_id(), "hvacsrv-test");
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
        assert_eq!(
            options.credentials(),
            Some(("user".to_string(), "secret".to_string()))
        );
    }

    #[tokio::test]
    async fn test_unreachable_broker_gives_up() {
        let config = BusConfig {
            port: 1,
            max_reconnect_attempts: 2,
            reconnect_delay_ms: 100,
            ..BusConfig::default()
        };
        let cancel = CancellationToken::new();
        let (bus, mut rx, task) = MqttBus::start(&config, cancel);

        assert!(bus.subscribe("hvac/1/mode").await.is_ok());
        assert_eq!(bus.publish("hvac/1/set/mode", "1").await, Err(BusError::NotConnected));

        match rx.recv().await {
            Some(BusEvent::Disconnected(_)) => {},
            other => panic!("expected disconnect, got {:?}", other),
        }
        task.await.unwrap();
        assert!(!bus.is_connected());
    }
}
