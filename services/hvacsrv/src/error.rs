//! Error handling for the HVAC service
//!
//! Link-level failures never escape the request executor; they are classified
//! and counted. The types here carry enough structure for that classification
//! and for the explicit rejections returned to command callers.

use thiserror::Error;

use crate::state::{DeviceId, Parameter};

/// Structured category of a link failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkErrorKind {
    /// Link unreachable or dropped
    Connection,
    /// Response addressed to another device (two exchanges overlapped)
    Conflict,
    /// No response inside the window
    Timeout,
    /// Anything else the client reported (exceptions, unparsed failures)
    Other,
}

/// Failure reported by the protocol client
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct LinkError {
    pub kind: LinkErrorKind,
    pub message: String,
}

impl LinkError {
    pub fn new(kind: LinkErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(LinkErrorKind::Connection, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(LinkErrorKind::Timeout, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(LinkErrorKind::Conflict, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(LinkErrorKind::Other, message)
    }

    pub fn not_connected() -> Self {
        Self::connection("link not connected")
    }

    pub fn is_connection(&self) -> bool {
        self.kind == LinkErrorKind::Connection
    }
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let kind = match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => LinkErrorKind::Timeout,
            ErrorKind::InvalidData => LinkErrorKind::Conflict,
            ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionRefused
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof => LinkErrorKind::Connection,
            _ => LinkErrorKind::Other,
        };
        Self::new(kind, err.to_string())
    }
}

/// The arbiter could not hand the link to the requested device
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArbiterError {
    #[error("link busy switching to device {switching_to}; device {requested} must try later")]
    Busy {
        requested: DeviceId,
        switching_to: DeviceId,
    },

    #[error("could not switch link to device {device}: {source}")]
    Switch {
        device: DeviceId,
        #[source]
        source: LinkError,
    },
}

/// Bus client failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("bus not connected")]
    NotConnected,

    #[error("bus client error: {0}")]
    Client(String),
}

/// Why a control command was rejected or failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// Caller-supplied value outside the allowed domain (no I/O attempted)
    #[error("invalid {parameter} value {value}: {reason}")]
    Validation {
        parameter: Parameter,
        value: String,
        reason: String,
    },

    /// Malformed request (unknown command kind, unparsable device, bad value type)
    #[error("{0}")]
    Rejected(String),

    #[error("unknown device {0}")]
    UnknownDevice(String),

    /// Every write attempt failed at the protocol level
    #[error("write of {parameter} to device {device} failed")]
    WriteFailed {
        device: DeviceId,
        parameter: Parameter,
    },

    /// Write still on the link when the wait expired; it may yet take effect
    #[error("write of {parameter} to device {device} not confirmed in time, outcome unknown")]
    WriteUnconfirmed {
        device: DeviceId,
        parameter: Parameter,
    },

    /// Write accepted but the confirmation read disagreed (or was unavailable)
    #[error(
        "device {device} did not confirm {parameter}: wrote {written}, read back {}",
        describe_read_back(.read_back)
    )]
    WriteConfirmationMismatch {
        device: DeviceId,
        parameter: Parameter,
        written: u16,
        read_back: Option<u16>,
    },

    #[error("bus command failed: {0}")]
    Bus(#[from] BusError),
}

fn describe_read_back(value: &Option<u16>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "nothing".to_string(),
    }
}

impl CommandError {
    pub fn validation(parameter: Parameter, value: impl ToString, reason: impl Into<String>) -> Self {
        Self::Validation {
            parameter,
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    /// Text shown to the operator
    pub fn user_message(&self) -> String {
        format!("command rejected: {}", self)
    }
}

/// Service-level errors (startup, configuration, wiring)
#[derive(Debug, Error)]
pub enum HvacError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HvacError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

impl From<figment::Error> for HvacError {
    fn from(err: figment::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result type alias for the HVAC service
pub type Result<T> = std::result::Result<T, HvacError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_io_error_kinds_map_to_link_kinds() {
        let timeout: LinkError = io::Error::new(io::ErrorKind::TimedOut, "late").into();
        assert_eq!(timeout.kind, LinkErrorKind::Timeout);

        let conflict: LinkError =
            io::Error::new(io::ErrorKind::InvalidData, "Invalid response header").into();
        assert_eq!(conflict.kind, LinkErrorKind::Conflict);

        let dropped: LinkError = io::Error::new(io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(dropped.is_connection());

        let other: LinkError = io::Error::new(io::ErrorKind::Other, "exception").into();
        assert_eq!(other.kind, LinkErrorKind::Other);
        assert_eq!(other.message, "exception");
    }

    #[test]
    fn test_command_error_messages() {
        let err = CommandError::validation(Parameter::Setpoint, 31, "must be within 16..=30");
        assert_eq!(
            err.user_message(),
            "command rejected: invalid setpoint value 31: must be within 16..=30"
        );

        let mismatch = CommandError::WriteConfirmationMismatch {
            device: DeviceId(2),
            parameter: Parameter::Setpoint,
            written: 22,
            read_back: Some(20),
        };
        assert_eq!(
            mismatch.to_string(),
            "device 2 did not confirm setpoint: wrote 22, read back 20"
        );
    }
}
