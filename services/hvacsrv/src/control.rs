//! Device control: validation and confirmed writes
//!
//! [`DeviceControl`] is what command intake talks to. On the link path every
//! setter writes through the request queue at high priority, waits for the
//! controller to settle, reads the register back and only reports success if
//! the value stuck. Out-of-range values are rejected before any I/O.

use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::broadcast::Broadcaster;
use crate::error::CommandError;
use crate::queue::{Priority, RequestQueue, WriteStatus};
use crate::registry::DeviceRegistry;
use crate::state::{DeviceId, FieldUpdate, OperatingMode, Parameter};

pub const SETPOINT_RANGE: RangeInclusive<i32> = 16..=30;
pub const FAN_SPEED_RANGE: RangeInclusive<i32> = 0..=3;
pub const MODE_RANGE: RangeInclusive<i32> = 0..=4;

pub fn validate_setpoint(value: i32) -> Result<u16, CommandError> {
    validate_range(Parameter::Setpoint, value, &SETPOINT_RANGE)
}

pub fn validate_fan_speed(value: i32) -> Result<u16, CommandError> {
    validate_range(Parameter::FanSpeed, value, &FAN_SPEED_RANGE)
}

/// Validate a raw mode code
pub fn validate_mode_code(value: i32) -> Result<OperatingMode, CommandError> {
    let raw = validate_range(Parameter::Mode, value, &MODE_RANGE)?;
    Ok(OperatingMode::from_raw(raw))
}

/// Register value for a mode; `Unknown` cannot be written
pub fn mode_register_value(mode: OperatingMode) -> Result<u16, CommandError> {
    mode.to_raw().ok_or_else(|| {
        CommandError::validation(
            Parameter::Mode,
            mode,
            "must be one of off, cool, heat, fan, auto",
        )
    })
}

fn validate_range(
    parameter: Parameter,
    value: i32,
    range: &RangeInclusive<i32>,
) -> Result<u16, CommandError> {
    if !range.contains(&value) {
        return Err(CommandError::validation(
            parameter,
            value,
            format!("must be within {}..={}", range.start(), range.end()),
        ));
    }
    u16::try_from(value).map_err(|_| CommandError::validation(parameter, value, "out of range"))
}

/// Control operations shared by both ingestion modes
#[async_trait]
pub trait DeviceControl: Send + Sync {
    async fn set_power(&self, device: DeviceId, on: bool) -> Result<(), CommandError>;

    async fn set_temperature_setpoint(&self, device: DeviceId, value: i32)
        -> Result<(), CommandError>;

    async fn set_fan_speed(&self, device: DeviceId, value: i32) -> Result<(), CommandError>;

    async fn set_mode(&self, device: DeviceId, mode: OperatingMode) -> Result<(), CommandError>;
}

/// Mode written by a power-on command
pub fn power_on_target(
    registry: &DeviceRegistry,
    device: DeviceId,
    fallback: OperatingMode,
) -> OperatingMode {
    registry.last_active_mode(device).unwrap_or(fallback)
}

/// Confirmed writes over the shared link
pub struct LinkController {
    registry: Arc<DeviceRegistry>,
    queue: Arc<RequestQueue>,
    broadcaster: Arc<dyn Broadcaster>,
    confirm_delay: Duration,
    power_on_mode: OperatingMode,
}

impl LinkController {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        queue: Arc<RequestQueue>,
        broadcaster: Arc<dyn Broadcaster>,
        confirm_delay: Duration,
        power_on_mode: OperatingMode,
    ) -> Self {
        Self {
            registry,
            queue,
            broadcaster,
            confirm_delay,
            power_on_mode,
        }
    }

    /// Write, settle, read back, compare. Updates the registry on success.
    async fn confirmed_write(
        &self,
        device: DeviceId,
        parameter: Parameter,
        value: u16,
        update: FieldUpdate,
    ) -> Result<(), CommandError> {
        let spec = self
            .registry
            .spec(device)
            .ok_or_else(|| CommandError::UnknownDevice(device.to_string()))?;
        let address = spec.registers.address(parameter);

        match self
            .queue
            .write_with_priority(device, address, value, Priority::High)
            .await
        {
            WriteStatus::Written => {},
            WriteStatus::Failed => {
                warn!(device = %device, "Write of {} = {} failed", parameter, value);
                return Err(CommandError::WriteFailed { device, parameter });
            },
            WriteStatus::Unconfirmed => {
                warn!(device = %device, "Write of {} = {} still pending", parameter, value);
                return Err(CommandError::WriteUnconfirmed { device, parameter });
            },
        }

        tokio::time::sleep(self.confirm_delay).await;

        let read_back = self
            .queue
            .read_with_priority(device, address, Priority::High)
            .await;
        if read_back != Some(value) {
            warn!(
                device = %device,
                "Write of {} not confirmed: wrote {}, read back {:?}",
                parameter, value, read_back
            );
            return Err(CommandError::WriteConfirmationMismatch {
                device,
                parameter,
                written: value,
                read_back,
            });
        }

        info!(device = %device, "{} set to {}", parameter, value);
        if let Some(state) = self.registry.apply(device, update) {
            self.broadcaster.push_device(&state);
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceControl for LinkController {
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
        self.confirmed_write(device, Parameter::Setpoint, raw, FieldUpdate::Setpoint(value))
            .await
    }

    async fn set_fan_speed(&self, device: DeviceId, value: i32) -> Result<(), CommandError> {
        let raw = validate_fan_speed(value)?;
        self.confirmed_write(device, Parameter::FanSpeed, raw, FieldUpdate::FanSpeed(value))
            .await
    }

    async fn set_mode(&self, device: DeviceId, mode: OperatingMode) -> Result<(), CommandError> {
        let raw = mode_register_value(mode)?;
        self.confirmed_write(device, Parameter::Mode, raw, FieldUpdate::Mode(mode))
            .await
    }
}
