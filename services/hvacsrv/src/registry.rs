//! Canonical device registry
//!
//! Owns the last-known [`DeviceState`] of every configured device plus its
//! static addressing (register map and topic map). Devices are created once at
//! startup and never removed. Locks are only held for plain field access,
//! never across an `.await`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::config::{BusConfig, DeviceConfig, RegisterMap};
use crate::state::{DeviceId, DeviceState, FieldUpdate, OperatingMode, Parameter};

/// Telemetry and command topics of one device, keyed by parameter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicMap {
    telemetry: HashMap<Parameter, String>,
    commands: HashMap<Parameter, String>,
}

impl TopicMap {
    /// Expand the templates for every parameter, then apply explicit overrides.
    pub fn build(device: &DeviceConfig, bus: &BusConfig) -> Self {
        let expand = |template: &str, parameter: Parameter| {
            template
                .replace("{id}", &device.id.to_string())
                .replace("{parameter}", parameter.as_str())
        };

        let mut map = Self::default();
        for parameter in Parameter::TELEMETRY {
            map.telemetry
                .insert(parameter, expand(&bus.topic_template, parameter));
            map.commands
                .insert(parameter, expand(&bus.command_template, parameter));
        }
        for entry in &device.topics {
            map.telemetry.insert(entry.parameter, entry.topic.clone());
            if let Some(command) = &entry.command_topic {
                map.commands.insert(entry.parameter, command.clone());
            }
        }
        map
    }

    pub fn telemetry(&self, parameter: Parameter) -> Option<&str> {
        self.telemetry.get(&parameter).map(String::as_str)
    }

    pub fn command(&self, parameter: Parameter) -> Option<&str> {
        self.commands.get(&parameter).map(String::as_str)
    }

    pub fn telemetry_topics(&self) -> impl Iterator<Item = (Parameter, &str)> {
        self.telemetry.iter().map(|(p, t)| (*p, t.as_str()))
    }
}

/// Static description of one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    pub id: DeviceId,
    pub name: String,
    pub registers: RegisterMap,
    pub topics: TopicMap,
}

impl DeviceSpec {
    pub fn from_config(device: &DeviceConfig, bus: &BusConfig) -> Self {
        Self {
            id: device.device_id(),
            name: device.display_name(),
            registers: device.registers,
            topics: TopicMap::build(device, bus),
        }
    }
}

#[derive(Debug)]
struct DeviceSlot {
    spec: Arc<DeviceSpec>,
    state: DeviceState,
    /// Most recent mode other than `Off`, restored by power-on
    last_active_mode: Option<OperatingMode>,
}

/// In-memory map from device id to last-known state
#[derive(Debug)]
pub struct DeviceRegistry {
    order: Vec<DeviceId>,
    slots: RwLock<HashMap<DeviceId, DeviceSlot>>,
}

impl DeviceRegistry {
    /// Create the registry with every device offline and zeroed. Later
    /// duplicates of an id are ignored.
    pub fn new(specs: impl IntoIterator<Item = DeviceSpec>) -> Self {
        let mut order = Vec::new();
        let mut slots = HashMap::new();
        for spec in specs {
            if slots.contains_key(&spec.id) {
                continue;
            }
            order.push(spec.id);
            let state = DeviceState::new(spec.id, spec.name.clone());
            slots.insert(
                spec.id,
                DeviceSlot {
                    spec: Arc::new(spec),
                    state,
                    last_active_mode: None,
                },
            );
        }
        debug!("Device registry created with {} devices", order.len());
        Self {
            order,
            slots: RwLock::new(slots),
        }
    }

    pub fn from_config(devices: &[DeviceConfig], bus: &BusConfig) -> Self {
        Self::new(devices.iter().map(|d| DeviceSpec::from_config(d, bus)))
    }

    /// Device ids in configured order
    pub fn ids(&self) -> &[DeviceId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: DeviceId) -> bool {
        self.slots.read().contains_key(&id)
    }

    pub fn spec(&self, id: DeviceId) -> Option<Arc<DeviceSpec>> {
        self.slots.read().get(&id).map(|slot| Arc::clone(&slot.spec))
    }

    pub fn get(&self, id: DeviceId) -> Option<DeviceState> {
        self.slots.read().get(&id).map(|slot| slot.state.clone())
    }

    /// All device states in configured order
    pub fn snapshot(&self) -> Vec<DeviceState> {
        let slots = self.slots.read();
        self.order
            .iter()
            .filter_map(|id| slots.get(id).map(|slot| slot.state.clone()))
            .collect()
    }

    /// Replace a device's state wholesale (poll path). Returns false for unknown ids.
    pub fn replace(&self, state: DeviceState) -> bool {
        let mut slots = self.slots.write();
        match slots.get_mut(&state.id) {
            Some(slot) => {
                if state.mode.is_on() && state.mode != OperatingMode::Unknown {
                    slot.last_active_mode = Some(state.mode);
                }
                slot.state = state;
                true
            },
            None => false,
        }
    }

    /// Apply one decoded field and mark the device online (bus and setter paths).
    pub fn apply(&self, id: DeviceId, update: FieldUpdate) -> Option<DeviceState> {
        let mut slots = self.slots.write();
        let slot = slots.get_mut(&id)?;
        update.apply(&mut slot.state);
        if let FieldUpdate::Mode(mode) = update {
            if mode.is_on() && mode != OperatingMode::Unknown {
                slot.last_active_mode = Some(mode);
            }
        }
        slot.state.touch();
        Some(slot.state.clone())
    }

    /// Flip a device offline; every other field keeps its last known value.
    pub fn mark_offline(&self, id: DeviceId) -> bool {
        match self.slots.write().get_mut(&id) {
            Some(slot) => {
                slot.state.online = false;
                true
            },
            None => false,
        }
    }

    pub fn mark_all_offline(&self) {
        for slot in self.slots.write().values_mut() {
            slot.state.online = false;
        }
    }

    pub fn last_active_mode(&self, id: DeviceId) -> Option<OperatingMode> {
        self.slots.read().get(&id).and_then(|slot| slot.last_active_mode)
    }

    pub fn online_count(&self) -> usize {
        self.slots.read().values().filter(|s| s.state.online).count()
    }
}
