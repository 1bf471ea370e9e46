//! In-memory collaborators for tests
//!
//! `ScriptedLink` stands in for the register link, `RecordingBroadcaster`
//! captures everything pushed downstream and `MockBus` records bus traffic.
//! Shared by the unit tests and the integration tests under `tests/`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::broadcast::Broadcaster;
use crate::bus::client::BusClient;
use crate::error::{BusError, LinkError};
use crate::link::client::RegisterLink;
use crate::state::DeviceState;

#[derive(Debug, Default)]
struct Registers {
    values: HashMap<(u8, u16), u16>,
    frozen: HashSet<(u8, u16)>,
    offline: HashSet<u8>,
    failures: VecDeque<LinkError>,
    writes: Vec<(u8, u16, u16)>,
}

/// Register link backed by a map keyed by `(unit, address)`
///
/// Unset registers read as `0`. Scripted failures are consumed one per
/// request, before anything else is considered.
#[derive(Debug)]
pub struct ScriptedLink {
    registers: Mutex<Registers>,
    connected: AtomicBool,
    reconnect_allowed: AtomicBool,
    active: AtomicU8,
    switches: AtomicUsize,
    requests: AtomicUsize,
    reconnects: AtomicUsize,
    response_delay: Mutex<Duration>,
}

impl Default for ScriptedLink {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedLink {
    pub fn new() -> Self {
        Self {
            registers: Mutex::new(Registers::default()),
            connected: AtomicBool::new(true),
            reconnect_allowed: AtomicBool::new(true),
            active: AtomicU8::new(0),
            switches: AtomicUsize::new(0),
            requests: AtomicUsize::new(0),
            reconnects: AtomicUsize::new(0),
            response_delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn set_register(&self, unit: u8, address: u16, value: u16) {
        self.registers.lock().values.insert((unit, address), value);
    }

    pub fn register(&self, unit: u8, address: u16) -> Option<u16> {
        self.registers.lock().values.get(&(unit, address)).copied()
    }

    /// Accept writes to this register without changing its value
    pub fn freeze_register(&self, unit: u8, address: u16) {
        self.registers.lock().frozen.insert((unit, address));
    }

    /// Every request to an offline unit times out
    pub fn set_offline(&self, unit: u8, offline: bool) {
        let mut registers = self.registers.lock();
        if offline {
            registers.offline.insert(unit);
        } else {
            registers.offline.remove(&unit);
        }
    }

    pub fn fail_next(&self, error: LinkError) {
        self.registers.lock().failures.push_back(error);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_reconnect_allowed(&self, allowed: bool) {
        self.reconnect_allowed.store(allowed, Ordering::SeqCst);
    }

    pub fn set_response_delay(&self, delay: Duration) {
        *self.response_delay.lock() = delay;
    }

    pub fn active_address(&self) -> u8 {
        self.active.load(Ordering::SeqCst)
    }

    pub fn address_switches(&self) -> usize {
        self.switches.load(Ordering::SeqCst)
    }

    /// Read and write requests seen, failed ones included
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn reconnects(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    /// Successful writes as `(unit, address, value)`
    pub fn writes(&self) -> Vec<(u8, u16, u16)> {
        self.registers.lock().writes.clone()
    }

    async fn begin_request(&self) -> Result<u8, LinkError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let delay = *self.response_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(LinkError::not_connected());
        }

        let unit = self.active_address();
        let mut registers = self.registers.lock();
        if let Some(err) = registers.failures.pop_front() {
            return Err(err);
        }
        if registers.offline.contains(&unit) {
            return Err(LinkError::timeout(format!("unit {} request timed out", unit)));
        }
        Ok(unit)
    }
}

#[async_trait]
impl RegisterLink for ScriptedLink {
    async fn set_active_address(&self, address: u8) -> Result<(), LinkError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(LinkError::not_connected());
        }
        self.active.store(address, Ordering::SeqCst);
        self.switches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_holding_registers(
        &self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, LinkError> {
        let unit = self.begin_request().await?;
        let registers = self.registers.lock();
        Ok((0..count)
            .map(|offset| {
                let key = (unit, address.wrapping_add(offset));
                registers.values.get(&key).copied().unwrap_or(0)
            })
            .collect())
    }

    async fn write_register(&self, address: u16, value: u16) -> Result<(), LinkError> {
        let unit = self.begin_request().await?;
        let mut registers = self.registers.lock();
        if !registers.frozen.contains(&(unit, address)) {
            registers.values.insert((unit, address), value);
        }
        registers.writes.push((unit, address, value));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn reconnect(&self) -> Result<(), LinkError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        if self.reconnect_allowed.load(Ordering::SeqCst) {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            Err(LinkError::connection("connection refused"))
        }
    }
}

#[derive(Debug, Default)]
struct Recorded {
    full: Vec<Vec<DeviceState>>,
    devices: Vec<DeviceState>,
    errors: Vec<String>,
}

/// Broadcaster that keeps everything it receives
#[derive(Debug, Default)]
pub struct RecordingBroadcaster {
    recorded: Mutex<Recorded>,
}

impl RecordingBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn full_pushes(&self) -> Vec<Vec<DeviceState>> {
        self.recorded.lock().full.clone()
    }

    pub fn device_updates(&self) -> Vec<DeviceState> {
        self.recorded.lock().devices.clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.recorded.lock().errors.clone()
    }
}

impl Broadcaster for RecordingBroadcaster {
    fn push_all(&self, devices: &[DeviceState]) {
        self.recorded.lock().full.push(devices.to_vec());
    }

    fn push_device(&self, device: &DeviceState) {
        self.recorded.lock().devices.push(device.clone());
    }

    fn push_error(&self, message: &str) {
        self.recorded.lock().errors.push(message.to_string());
    }
}

/// Bus client that records subscriptions and publishes
#[derive(Debug)]
pub struct MockBus {
    connected: AtomicBool,
    subscriptions: Mutex<Vec<String>>,
    published: Mutex<Vec<(String, String)>>,
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBus {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            subscriptions: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().clone()
    }

    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl BusClient for MockBus {
    async fn subscribe(&self, topic: &str) -> Result<(), BusError> {
        self.subscriptions.lock().push(topic.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        self.published
            .lock()
            .push((topic.to_string(), payload.to_string()));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
