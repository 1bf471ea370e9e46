//! Gateway ingestion over a publish/subscribe bus

pub mod aggregator;
pub mod client;
pub mod debounce;

pub use aggregator::BusStateAggregator;
pub use client::{BusClient, BusEvent, MqttBus};
pub use debounce::Debouncer;
