//! HVAC fleet state service (hvacsrv)
//!
//! Keeps a fleet of HVAC controllers represented as one consistent in-memory
//! snapshot, sourced either from a shared Modbus link that multiplexes
//! several unit ids or from an MQTT gateway publishing per-device telemetry.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐
//! │  Poll cycle     │───►│ RequestExecutor │───►│  LinkArbiter    │──► Modbus link
//! │  Request queue  │    │ (retry, stats)  │    │ (unit switches) │
//! └─────────────────┘    └─────────────────┘    └─────────────────┘
//!          │
//!          ▼
//! ┌─────────────────┐    ┌─────────────────┐
//! │ DeviceRegistry  │───►│   Broadcaster   │──► downstream clients
//! └─────────────────┘    └─────────────────┘
//!          ▲
//!          │
//! ┌─────────────────┐
//! │ Bus aggregator  │◄── MQTT telemetry (debounced)
//! └─────────────────┘
//! ```

pub mod broadcast;
pub mod bus;
pub mod command;
pub mod config;
pub mod control;
pub mod error;
pub mod link;
pub mod poller;
pub mod queue;
pub mod registry;
pub mod runtime;
pub mod state;
pub mod stats;
pub mod test_utils;

pub use broadcast::{BroadcastHub, Broadcaster, HubEvent};
pub use config::{Config, ServiceMode};
pub use error::{HvacError, Result};
pub use registry::DeviceRegistry;
pub use state::{DeviceId, DeviceState, OperatingMode};
