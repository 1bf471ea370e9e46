//! Device state model and register decoding
//!
//! Every derived field of [`DeviceState`] goes through the helpers in this
//! module, so both ingestion paths (link polling and bus telemetry) decode
//! raw values identically.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Scale applied to raw temperature registers (0.5 degree per count)
pub const TEMPERATURE_SCALE: f64 = 0.5;
/// Offset applied after scaling raw temperature registers
pub const TEMPERATURE_OFFSET: f64 = -20.0;

const PUMP_RUNNING_BIT: u16 = 0;
const VALVE_OPEN_BIT: u16 = 9;

/// Link address of one HVAC controller; also its stable identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u8);

impl DeviceId {
    pub fn address(self) -> u8 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for DeviceId {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

/// Operating mode reported by the controller's mode register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    #[default]
    Off,
    Cool,
    Heat,
    Fan,
    Auto,
    Unknown,
}

impl OperatingMode {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0 => Self::Off,
            1 => Self::Cool,
            2 => Self::Heat,
            3 => Self::Fan,
            4 => Self::Auto,
            _ => Self::Unknown,
        }
    }

    /// Register value for this mode; `None` for `Unknown`, which cannot be written.
    pub fn to_raw(self) -> Option<u16> {
        match self {
            Self::Off => Some(0),
            Self::Cool => Some(1),
            Self::Heat => Some(2),
            Self::Fan => Some(3),
            Self::Auto => Some(4),
            Self::Unknown => None,
        }
    }

    pub fn is_on(self) -> bool {
        self != Self::Off
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Off => "off",
            Self::Cool => "cool",
            Self::Heat => "heat",
            Self::Fan => "fan",
            Self::Auto => "auto",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for OperatingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "cool" => Ok(Self::Cool),
            "heat" => Ok(Self::Heat),
            "fan" => Ok(Self::Fan),
            "auto" => Ok(Self::Auto),
            other => Err(format!("unknown operating mode '{}'", other)),
        }
    }
}

/// Fault flags decoded from the error status word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ErrorFlags {
    /// Bit 2
    pub high_pressure: bool,
    /// Bit 3
    pub low_pressure: bool,
    /// Bit 4
    pub compressor_overload: bool,
    /// Bit 8
    pub water_flow: bool,
    /// Bit 14
    pub sensor_fault: bool,
}

impl ErrorFlags {
    pub fn from_word(word: u16) -> Self {
        Self {
            high_pressure: bit(word, 2),
            low_pressure: bit(word, 3),
            compressor_overload: bit(word, 4),
            water_flow: bit(word, 8),
            sensor_fault: bit(word, 14),
        }
    }

    pub fn any(&self) -> bool {
        self.high_pressure
            || self.low_pressure
            || self.compressor_overload
            || self.water_flow
            || self.sensor_fault
    }
}

fn bit(word: u16, position: u16) -> bool {
    word & (1 << position) != 0
}

/// Degrees from a raw temperature register.
pub fn temperature_from_raw(raw: u16) -> f64 {
    f64::from(raw) * TEMPERATURE_SCALE + TEMPERATURE_OFFSET
}

pub fn pump_running(status_word: u16) -> bool {
    bit(status_word, PUMP_RUNNING_BIT)
}

pub fn valve_open(status_word: u16) -> bool {
    bit(status_word, VALVE_OPEN_BIT)
}

/// Last-known state of one controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub id: DeviceId,
    pub name: String,
    pub online: bool,
    pub mode: OperatingMode,
    pub power: bool,
    pub setpoint: i32,
    pub fan_speed: i32,
    pub air_temperature: f64,
    pub water_temperature: f64,
    pub pump_running: bool,
    pub valve_open: bool,
    pub errors: ErrorFlags,
    pub protection: u16,
    pub updated_at: Option<DateTime<Utc>>,
}

impl DeviceState {
    /// All-zero, powered-off, offline state used at startup.
    pub fn new(id: DeviceId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            online: false,
            mode: OperatingMode::Off,
            power: false,
            setpoint: 0,
            fan_speed: 0,
            air_temperature: 0.0,
            water_temperature: 0.0,
            pump_running: false,
            valve_open: false,
            errors: ErrorFlags::default(),
            protection: 0,
            updated_at: None,
        }
    }

    /// Build a fresh online state from one poll pass; failed reads count as `0`.
    pub fn from_readings(id: DeviceId, name: impl Into<String>, readings: &RawReadings) -> Self {
        let mut state = Self::new(id, name);
        state.set_mode(OperatingMode::from_raw(readings.mode.unwrap_or(0)));
        state.setpoint = i32::from(readings.setpoint.unwrap_or(0));
        state.fan_speed = i32::from(readings.fan_speed.unwrap_or(0));
        state.air_temperature = readings.air_temperature.map(temperature_from_raw).unwrap_or(0.0);
        state.water_temperature = readings
            .water_temperature
            .map(temperature_from_raw)
            .unwrap_or(0.0);
        state.pump_running = readings.pump_status.map(pump_running).unwrap_or(false);
        state.valve_open = readings.valve_status.map(valve_open).unwrap_or(false);
        state.errors = ErrorFlags::from_word(readings.error_status.unwrap_or(0));
        state.protection = readings.protection.unwrap_or(0);
        state.online = true;
        state.updated_at = Some(Utc::now());
        state
    }

    /// Set the mode and keep the derived power flag consistent.
    pub fn set_mode(&mut self, mode: OperatingMode) {
        self.mode = mode;
        self.power = mode.is_on();
    }

    pub fn touch(&mut self) {
        self.online = true;
        self.updated_at = Some(Utc::now());
    }
}

/// Raw register values collected during one poll of a device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawReadings {
    pub mode: Option<u16>,
    pub setpoint: Option<u16>,
    pub fan_speed: Option<u16>,
    pub air_temperature: Option<u16>,
    pub water_temperature: Option<u16>,
    pub pump_status: Option<u16>,
    pub valve_status: Option<u16>,
    pub error_status: Option<u16>,
    pub protection: Option<u16>,
}

/// Logical parameters carried per device on both channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parameter {
    Mode,
    Setpoint,
    FanSpeed,
    AirTemperature,
    WaterTemperature,
    Pump,
    Valve,
}

impl Parameter {
    /// Parameters the bus gateway publishes telemetry for
    pub const TELEMETRY: [Parameter; 7] = [
        Parameter::Mode,
        Parameter::Setpoint,
        Parameter::FanSpeed,
        Parameter::AirTemperature,
        Parameter::WaterTemperature,
        Parameter::Pump,
        Parameter::Valve,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mode => "mode",
            Self::Setpoint => "setpoint",
            Self::FanSpeed => "fan_speed",
            Self::AirTemperature => "air_temperature",
            Self::WaterTemperature => "water_temperature",
            Self::Pump => "pump",
            Self::Valve => "valve",
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded field value, ready to apply to a [`DeviceState`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldUpdate {
    Mode(OperatingMode),
    Setpoint(i32),
    FanSpeed(i32),
    AirTemperature(f64),
    WaterTemperature(f64),
    Pump(bool),
    Valve(bool),
}

impl FieldUpdate {
    pub fn apply(self, state: &mut DeviceState) {
        match self {
            Self::Mode(mode) => state.set_mode(mode),
            Self::Setpoint(value) => state.setpoint = value,
            Self::FanSpeed(value) => state.fan_speed = value,
            Self::AirTemperature(value) => state.air_temperature = value,
            Self::WaterTemperature(value) => state.water_temperature = value,
            Self::Pump(value) => state.pump_running = value,
            Self::Valve(value) => state.valve_open = value,
        }
    }
}

/// Payload decoding failure on the bus path
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot decode {parameter} from payload '{payload}'")]
pub struct DecodeError {
    pub parameter: Parameter,
    pub payload: String,
}

/// Decode a bus payload with the same rules as the register path.
pub fn decode_payload(parameter: Parameter, payload: &str) -> Result<FieldUpdate, DecodeError> {
    let text = payload.trim();
    let fail = || DecodeError {
        parameter,
        payload: text.to_string(),
    };

    match parameter {
        Parameter::Pump => parse_flag(text).map(FieldUpdate::Pump).ok_or_else(fail),
        Parameter::Valve => parse_word(text)
            .map(|word| FieldUpdate::Valve(valve_open(word)))
            .ok_or_else(fail),
        Parameter::Mode => parse_word(text)
            .map(|raw| FieldUpdate::Mode(OperatingMode::from_raw(raw)))
            .ok_or_else(fail),
        Parameter::Setpoint => parse_integer(text).map(FieldUpdate::Setpoint).ok_or_else(fail),
        Parameter::FanSpeed => parse_integer(text).map(FieldUpdate::FanSpeed).ok_or_else(fail),
        Parameter::AirTemperature => parse_word(text)
            .map(|raw| FieldUpdate::AirTemperature(temperature_from_raw(raw)))
            .ok_or_else(fail),
        Parameter::WaterTemperature => parse_word(text)
            .map(|raw| FieldUpdate::WaterTemperature(temperature_from_raw(raw)))
            .ok_or_else(fail),
    }
}

fn parse_number(text: &str) -> Option<f64> {
    text.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn parse_integer(text: &str) -> Option<i32> {
    let value = parse_number(text)?;
    if value.fract() != 0.0 || value < f64::from(i32::MIN) || value > f64::from(i32::MAX) {
        return None;
    }
    Some(value as i32)
}

fn parse_word(text: &str) -> Option<u16> {
    let value = parse_integer(text)?;
    u16::try_from(value).ok()
}

fn parse_flag(text: &str) -> Option<bool> {
    match text.to_ascii_lowercase().as_str() {
        "true" | "on" => Some(true),
        "false" | "off" => Some(false),
        _ => parse_number(text).map(|v| v != 0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_from_temperature(degrees: f64) -> u16 {
        ((degrees - TEMPERATURE_OFFSET) / TEMPERATURE_SCALE).round() as u16
    }

    #[test]
    fn test_temperature_transform() {
        assert_eq!(temperature_from_raw(0), -20.0);
        assert_eq!(temperature_from_raw(40), 0.0);
        assert_eq!(temperature_from_raw(85), 22.5);
        assert_eq!(temperature_from_raw(u16::MAX), 32747.5);
    }

    #[test]
    fn test_temperature_inverse_is_exact() {
        for raw in [0u16, 1, 39, 40, 41, 85, 100, 1000, 65535] {
            assert_eq!(raw_from_temperature(temperature_from_raw(raw)), raw);
        }
    }

    #[test]
    fn test_status_bits_are_independent() {
        assert!(pump_running(0b1));
        assert!(!valve_open(0b1));
        assert!(valve_open(1 << 9));
        assert!(!pump_running(1 << 9));
        assert!(pump_running(1 | (1 << 9)) && valve_open(1 | (1 << 9)));
    }

    #[test]
    fn test_error_flags_bit_positions() {
        let positions = [2u16, 3, 4, 8, 14];
        for (index, position) in positions.iter().enumerate() {
            let flags = ErrorFlags::from_word(1 << position);
            let values = [
                flags.high_pressure,
                flags.low_pressure,
                flags.compressor_overload,
                flags.water_flow,
                flags.sensor_fault,
            ];
            for (other, value) in values.iter().enumerate() {
                assert_eq!(*value, other == index, "bit {} leaked into flag {}", position, other);
            }
        }

        // Bits outside the error set are ignored
        let unrelated = (1 << 0) | (1 << 1) | (1 << 9) | (1 << 15);
        assert!(!ErrorFlags::from_word(unrelated).any());
    }

    #[test]
    fn test_mode_codes() {
        assert_eq!(OperatingMode::from_raw(0), OperatingMode::Off);
        assert_eq!(OperatingMode::from_raw(4), OperatingMode::Auto);
        assert_eq!(OperatingMode::from_raw(9), OperatingMode::Unknown);
        assert_eq!(OperatingMode::Heat.to_raw(), Some(2));
        assert_eq!(OperatingMode::Unknown.to_raw(), None);
        assert_eq!("COOL".parse::<OperatingMode>(), Ok(OperatingMode::Cool));
    }

    #[test]
    fn test_from_readings_substitutes_zero_for_failed_reads() {
        let readings = RawReadings {
            mode: Some(2),
            setpoint: Some(22),
            air_temperature: Some(90),
            pump_status: None,
            valve_status: Some(1 << 9),
            error_status: Some(1 << 3),
            protection: Some(1 << 3),
            ..Default::default()
        };

        let state = DeviceState::from_readings(DeviceId(3), "lobby", &readings);
        assert!(state.online);
        assert!(state.power);
        assert_eq!(state.mode, OperatingMode::Heat);
        assert_eq!(state.setpoint, 22);
        assert_eq!(state.fan_speed, 0);
        assert_eq!(state.air_temperature, 25.0);
        assert_eq!(state.water_temperature, 0.0);
        assert!(!state.pump_running);
        assert!(state.valve_open);
        assert!(state.errors.low_pressure);
        assert_eq!(state.protection, 8);
    }

    #[test]
    fn test_decode_payload_rules() {
        assert_eq!(
            decode_payload(Parameter::AirTemperature, "84"),
            Ok(FieldUpdate::AirTemperature(22.0))
        );
        assert_eq!(
            decode_payload(Parameter::Valve, "512"),
            Ok(FieldUpdate::Valve(true))
        );
        assert_eq!(decode_payload(Parameter::Valve, "1"), Ok(FieldUpdate::Valve(false)));
        assert_eq!(decode_payload(Parameter::Pump, "true"), Ok(FieldUpdate::Pump(true)));
        assert_eq!(decode_payload(Parameter::Pump, "0"), Ok(FieldUpdate::Pump(false)));
        assert_eq!(decode_payload(Parameter::Setpoint, " 23 "), Ok(FieldUpdate::Setpoint(23)));
        assert_eq!(
            decode_payload(Parameter::Mode, "1"),
            Ok(FieldUpdate::Mode(OperatingMode::Cool))
        );
        assert!(decode_payload(Parameter::FanSpeed, "fast").is_err());
        assert!(decode_payload(Parameter::AirTemperature, "-3").is_err());
        assert!(decode_payload(Parameter::Setpoint, "22.5").is_err());
    }

    #[test]
    fn test_field_update_keeps_power_consistent() {
        let mut state = DeviceState::new(DeviceId(1), "a");
        FieldUpdate::Mode(OperatingMode::Fan).apply(&mut state);
        assert!(state.power);
        FieldUpdate::Mode(OperatingMode::Off).apply(&mut state);
        assert!(!state.power);
    }
}
