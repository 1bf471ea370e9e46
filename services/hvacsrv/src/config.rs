//! Service configuration
//!
//! Layered with figment: built-in defaults, then the YAML file, then
//! `HVACSRV_`-prefixed environment variables (`__` separates nested keys,
//! e.g. `HVACSRV_LINK__HOST=10.0.0.5`).

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{HvacError, Result};
use crate::state::{DeviceId, OperatingMode, Parameter};

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "config/hvacsrv.yaml";
/// Environment variable prefix
pub const ENV_PREFIX: &str = "HVACSRV_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub link: LinkConfig,
    pub bus: BusConfig,
    pub devices: Vec<DeviceConfig>,
    pub commands: CommandConfig,
    pub logging: LoggingConfig,
}

/// Which ingestion channel this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ServiceMode {
    /// Active polling over the shared Modbus link
    #[default]
    Link,
    /// Passive aggregation of gateway telemetry from the MQTT bus
    Bus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub mode: ServiceMode,
    /// Capacity of the downstream broadcast channel
    pub broadcast_capacity: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "hvacsrv".to_string(),
            mode: ServiceMode::Link,
            broadcast_capacity: 256,
        }
    }
}

/// Modbus framing used on the TCP connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// Modbus TCP (MBAP header carries the unit id)
    #[default]
    Tcp,
    /// RTU frames tunnelled through a TCP serial gateway
    RtuOverTcp,
}

/// Shared link connection and timing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub host: String,
    pub port: u16,
    pub framing: Framing,
    pub connect_timeout_ms: u64,
    /// Upper bound for one request/response exchange
    pub response_timeout_ms: u64,
    /// Settle time after switching the active address
    pub settle_delay_ms: u64,
    /// Base delay for retry backoff
    pub request_delay_ms: u64,
    pub max_retries: u32,
    /// Pause between a write and its confirmation read
    pub confirm_delay_ms: u64,
    pub probe_timeout_ms: u64,
    pub inter_request_delay_ms: u64,
    pub inter_device_delay_ms: u64,
    pub poll_interval_ms: u64,
    pub queue_tick_ms: u64,
    /// How long priority read/write callers wait for their queued result
    pub queue_wait_ms: u64,
    pub reconnect: ReconnectConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 502,
            framing: Framing::Tcp,
            connect_timeout_ms: 5000,
            response_timeout_ms: 1000,
            settle_delay_ms: 200,
            request_delay_ms: 100,
            max_retries: 3,
            confirm_delay_ms: 150,
            probe_timeout_ms: 3000,
            inter_request_delay_ms: 150,
            inter_device_delay_ms: 500,
            poll_interval_ms: 5000,
            queue_tick_ms: 50,
            queue_wait_ms: 10_000,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl LinkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn confirm_delay(&self) -> Duration {
        Duration::from_millis(self.confirm_delay_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn inter_request_delay(&self) -> Duration {
        Duration::from_millis(self.inter_request_delay_ms)
    }

    pub fn inter_device_delay(&self) -> Duration {
        Duration::from_millis(self.inter_device_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn queue_tick(&self) -> Duration {
        Duration::from_millis(self.queue_tick_ms)
    }

    pub fn queue_wait(&self) -> Duration {
        Duration::from_millis(self.queue_wait_ms)
    }
}

/// Link reconnection policy (0 attempts means unlimited)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// MQTT bus settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Quiet period before a merged snapshot is broadcast
    pub debounce_ms: u64,
    /// Wait between publishing a command and forcing a flush
    pub command_settle_ms: u64,
    /// Telemetry topic template; `{id}` and `{parameter}` are substituted
    pub topic_template: String,
    /// Command topic template; `{id}` and `{parameter}` are substituted
    pub command_template: String,
    pub reconnect_delay_ms: u64,
    /// Consecutive failed reconnects before the bus client gives up
    pub max_reconnect_attempts: u32,
    /// Capacity of the rumqttc request channel and of the inbound message channel
    pub channel_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "hvacsrv".to_string(),
            keep_alive_secs: 30,
            username: None,
            password: None,
            debounce_ms: 1000,
            command_settle_ms: 500,
            topic_template: "hvac/{id}/{parameter}".to_string(),
            command_template: "hvac/{id}/set/{parameter}".to_string(),
            reconnect_delay_ms: 5000,
            max_reconnect_attempts: 10,
            channel_capacity: 64,
        }
    }
}

impl BusConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn command_settle(&self) -> Duration {
        Duration::from_millis(self.command_settle_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Holding-register addresses of one controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterMap {
    pub mode: u16,
    pub setpoint: u16,
    pub fan_speed: u16,
    pub air_temperature: u16,
    pub water_temperature: u16,
    pub pump_status: u16,
    pub valve_status: u16,
    pub error_status: u16,
    /// Same address as `error_status` unless the controller exposes a separate word
    pub protection: u16,
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self {
            mode: 0,
            setpoint: 1,
            fan_speed: 2,
            air_temperature: 3,
            water_temperature: 4,
            pump_status: 5,
            valve_status: 6,
            error_status: 7,
            protection: 7,
        }
    }
}

impl RegisterMap {
    /// Address of a writable or telemetry parameter
    pub fn address(&self, parameter: Parameter) -> u16 {
        match parameter {
            Parameter::Mode => self.mode,
            Parameter::Setpoint => self.setpoint,
            Parameter::FanSpeed => self.fan_speed,
            Parameter::AirTemperature => self.air_temperature,
            Parameter::WaterTemperature => self.water_temperature,
            Parameter::Pump => self.pump_status,
            Parameter::Valve => self.valve_status,
        }
    }

    pub fn protection_shares_error_word(&self) -> bool {
        self.protection == self.error_status
    }
}

/// Per-device configuration entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Link address, also the stable identifier
    pub id: u8,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub registers: RegisterMap,
    /// Explicit topic overrides; missing parameters use the bus templates
    #[serde(default)]
    pub topics: Vec<TopicOverride>,
}

impl DeviceConfig {
    pub fn device_id(&self) -> DeviceId {
        DeviceId(self.id)
    }

    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("hvac_{}", self.id))
    }
}

/// Topic override for one parameter of one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicOverride {
    pub parameter: Parameter,
    pub topic: String,
    #[serde(default)]
    pub command_topic: Option<String>,
}

/// Command intake settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Prefix stripped from external device identifiers (`hvac_3` → device 3)
    pub device_prefix: String,
    /// Mode written by a power-on command when no previous mode is known
    pub power_on_mode: OperatingMode,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            device_prefix: "hvac_".to_string(),
            power_on_mode: OperatingMode::Cool,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Directory for rolling log files; console only when unset
    pub dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
        }
    }
}

impl Config {
    /// Load defaults, then the YAML file (if present), then the environment.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading configuration from {}", path.display());

        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::from_figment(figment)
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        Ok(figment.extract()?)
    }

    /// Reject configurations the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(HvacError::config("no devices configured"));
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.id) {
                return Err(HvacError::config(format!(
                    "duplicate device id {}",
                    device.id
                )));
            }
        }

        if self.link.poll_interval_ms == 0 {
            return Err(HvacError::config("link.poll_interval_ms must be > 0"));
        }
        if self.link.queue_tick_ms == 0 {
            return Err(HvacError::config("link.queue_tick_ms must be > 0"));
        }
        if self.service.broadcast_capacity == 0 {
            return Err(HvacError::config("service.broadcast_capacity must be > 0"));
        }
        if self.bus.channel_capacity == 0 {
            return Err(HvacError::config("bus.channel_capacity must be > 0"));
        }

        Ok(())
    }
}
