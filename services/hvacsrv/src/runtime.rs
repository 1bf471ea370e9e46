//! Service runtime: link reconnection and component wiring

pub mod reconnect;
pub mod service;

pub use reconnect::{ConnectionState, ReconnectError, ReconnectHelper, ReconnectPolicy};
pub use service::{serve_commands, start, start_bus, start_link, ServiceHandle};
