//! Shared point-to-point link: client, address arbitration, retrying executor

pub mod arbiter;
pub mod client;
pub mod executor;

pub use arbiter::{LinkArbiter, LinkState};
pub use client::{ModbusLink, RegisterLink};
pub use executor::{Operation, RequestExecutor, Response, RetryPolicy};
