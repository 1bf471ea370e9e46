//! Command intake
//!
//! Downstream clients send `{device, command, value}` tuples. The device is
//! addressed as `<prefix><id>` (default `hvac_3`), the command is one of
//! `power`, `set_temperature`, `set_fan_speed` or `set_mode`. Anything that
//! does not parse is rejected with an explicit [`CommandError`] and never
//! reaches the link or the bus. Operator commands (`stats`, `reset_stats`)
//! need no device and are answered by the service itself.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::control::{validate_mode_code, DeviceControl};
use crate::error::CommandError;
use crate::state::{DeviceId, OperatingMode};
use crate::stats::StatsSnapshot;

pub const STATS_COMMAND: &str = "stats";
pub const RESET_STATS_COMMAND: &str = "reset_stats";

/// Raw command as received from a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    #[serde(default)]
    pub device: String,
    pub command: String,
    #[serde(default)]
    pub value: Value,
}

/// Reply sent back for every command, accepted or not
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandReply {
    pub device: String,
    pub command: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Link statistics, only on operator replies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<StatsSnapshot>,
}

impl CommandReply {
    pub fn from_result(request: &CommandRequest, result: Result<(), CommandError>) -> Self {
        let error = result.err().map(|e| {
            warn!("Command {} for {} rejected: {}", request.command, request.device, e);
            e.user_message()
        });
        Self {
            device: request.device.clone(),
            command: request.command.clone(),
            success: error.is_none(),
            error,
            stats: None,
        }
    }
}

/// Parsed command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Power(bool),
    SetTemperature(i32),
    SetFanSpeed(i32),
    SetMode(OperatingMode),
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Power(on) => write!(f, "power {}", if *on { "on" } else { "off" }),
            Self::SetTemperature(value) => write!(f, "setpoint {}", value),
            Self::SetFanSpeed(value) => write!(f, "fan speed {}", value),
            Self::SetMode(mode) => write!(f, "mode {}", mode),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandParser {
    prefix: String,
    known: HashSet<DeviceId>,
}

impl CommandParser {
    pub fn new(prefix: impl Into<String>, devices: impl IntoIterator<Item = DeviceId>) -> Self {
        Self {
            prefix: prefix.into(),
            known: devices.into_iter().collect(),
        }
    }

    /// Strip the prefix and parse the numeric suffix.
    pub fn device_id(&self, device: &str) -> Result<DeviceId, CommandError> {
        let suffix = device.strip_prefix(self.prefix.as_str()).ok_or_else(|| {
            CommandError::Rejected(format!(
                "device '{}' does not start with '{}'",
                device, self.prefix
            ))
        })?;
        let id = suffix
            .parse::<u8>()
            .map(DeviceId)
            .map_err(|_| CommandError::Rejected(format!("invalid device id '{}'", device)))?;

        if !self.known.contains(&id) {
            return Err(CommandError::UnknownDevice(device.to_string()));
        }
        Ok(id)
    }

    pub fn parse(&self, request: &CommandRequest) -> Result<(DeviceId, Action), CommandError> {
        let device = self.device_id(&request.device)?;
        let value = &request.value;

        let action = match request.command.as_str() {
            "power" => Action::Power(as_flag(value).ok_or_else(|| wrong_type("power", value))?),
            "set_temperature" => Action::SetTemperature(
                as_integer(value).ok_or_else(|| wrong_type("set_temperature", value))?,
            ),
            "set_fan_speed" => Action::SetFanSpeed(
                as_integer(value).ok_or_else(|| wrong_type("set_fan_speed", value))?,
            ),
            "set_mode" => Action::SetMode(as_mode(value)?),
            other => {
                return Err(CommandError::Rejected(format!("unknown command '{}'", other)));
            },
        };
        Ok((device, action))
    }
}

fn wrong_type(command: &str, value: &Value) -> CommandError {
    CommandError::Rejected(format!("invalid value {} for {}", value, command))
}

fn as_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::Number(n) => n.as_i64().map(|v| v != 0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "on" | "true" | "1" => Some(true),
            "off" | "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn as_integer(value: &Value) -> Option<i32> {
    let raw = match value {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    i32::try_from(raw).ok()
}

fn as_mode(value: &Value) -> Result<OperatingMode, CommandError> {
    if let Value::String(name) = value {
        if let Ok(mode) = name.parse::<OperatingMode>() {
            return Ok(mode);
        }
    }
    let code = as_integer(value).ok_or_else(|| wrong_type("set_mode", value))?;
    validate_mode_code(code)
}

/// Run one parsed action against a controller.
pub async fn dispatch(
    control: &dyn DeviceControl,
    device: DeviceId,
    action: Action,
) -> Result<(), CommandError> {
    match action {
        Action::Power(on) => control.set_power(device, on).await,
        Action::SetTemperature(value) => control.set_temperature_setpoint(device, value).await,
        Action::SetFanSpeed(value) => control.set_fan_speed(device, value).await,
        Action::SetMode(mode) => control.set_mode(device, mode).await,
    }
}

/// Parse, dispatch and build the reply.
pub async fn handle(
    parser: &CommandParser,
    control: &dyn DeviceControl,
    request: &CommandRequest,
) -> CommandReply {
    let result = match parser.parse(request) {
        Ok((device, action)) => {
            info!(device = %device, "Command: {}", action);
            dispatch(control, device, action).await
        },
        Err(e) => Err(e),
    };
    CommandReply::from_result(request, result)
}
