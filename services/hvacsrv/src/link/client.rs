//! Register client for the shared link
//!
//! [`RegisterLink`] is the seam between the arbitration/retry layer and the
//! wire. [`ModbusLink`] implements it on top of `tokio-modbus`, either with
//! Modbus TCP framing or with RTU frames tunnelled through a TCP serial
//! gateway. The unit id carried by every frame is the active device address.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::{debug, error, info, warn};

use crate::config::{Framing, LinkConfig};
use crate::error::LinkError;

/// Register-level operations on the shared link
#[async_trait]
pub trait RegisterLink: Send + Sync {
    /// Route subsequent requests to another unit address
    async fn set_active_address(&self, address: u8) -> Result<(), LinkError>;

    async fn read_holding_registers(&self, address: u16, count: u16)
        -> Result<Vec<u16>, LinkError>;

    async fn write_register(&self, address: u16, value: u16) -> Result<(), LinkError>;

    fn is_connected(&self) -> bool;

    /// Drop any existing connection and open a new one
    async fn reconnect(&self) -> Result<(), LinkError>;
}

/// `tokio-modbus` backed link over one TCP connection
pub struct ModbusLink {
    host: String,
    port: u16,
    framing: Framing,
    connect_timeout: Duration,
    response_timeout: Duration,
    context: Mutex<Option<Context>>,
    connected: AtomicBool,
    active_address: AtomicU8,
}

impl std::fmt::Debug for ModbusLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusLink")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("framing", &self.framing)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl ModbusLink {
    pub fn new(config: &LinkConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            framing: config.framing,
            connect_timeout: config.connect_timeout(),
            response_timeout: config.response_timeout(),
            context: Mutex::new(None),
            connected: AtomicBool::new(false),
            active_address: AtomicU8::new(0),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Open the TCP connection and attach the configured framing.
    pub async fn connect(&self) -> Result<(), LinkError> {
        let endpoint = self.endpoint();
        debug!("Connecting to Modbus link at {} ({:?})", endpoint, self.framing);

        let stream = match timeout(self.connect_timeout, TcpStream::connect(&endpoint)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                error!("Failed to connect to Modbus link {}: {}", endpoint, e);
                self.connected.store(false, Ordering::Release);
                return Err(LinkError::connection(format!(
                    "failed to connect to {}: {}",
                    endpoint, e
                )));
            },
            Err(_) => {
                error!(
                    "Connection to Modbus link {} timed out after {:?}",
                    endpoint, self.connect_timeout
                );
                self.connected.store(false, Ordering::Release);
                return Err(LinkError::connection(format!(
                    "connection to {} timed out after {:?}",
                    endpoint, self.connect_timeout
                )));
            },
        };

        let slave = Slave(self.active_address.load(Ordering::Acquire));
        let ctx = match self.framing {
            Framing::Tcp => tcp::attach_slave(stream, slave),
            Framing::RtuOverTcp => rtu::attach_slave(stream, slave),
        };

        *self.context.lock().await = Some(ctx);
        self.connected.store(true, Ordering::Release);
        info!("Connected to Modbus link at {}", endpoint);
        Ok(())
    }

    pub async fn disconnect(&self) {
        let mut guard = self.context.lock().await;
        if guard.take().is_some() {
            debug!("Disconnected from Modbus link {}", self.endpoint());
        }
        self.connected.store(false, Ordering::Release);
    }

    /// Map a failed exchange and drop the context when the link itself broke.
    fn fail(&self, ctx: &mut Option<Context>, err: LinkError) -> LinkError {
        if err.is_connection() {
            warn!("Modbus link {} lost: {}", self.endpoint(), err);
            *ctx = None;
            self.connected.store(false, Ordering::Release);
        }
        err
    }
}

#[async_trait]
impl RegisterLink for ModbusLink {
    async fn set_active_address(&self, address: u8) -> Result<(), LinkError> {
        let mut guard = self.context.lock().await;
        self.active_address.store(address, Ordering::Release);
        match guard.as_mut() {
            Some(ctx) => {
                ctx.set_slave(Slave(address));
                Ok(())
            },
            None => Err(LinkError::not_connected()),
        }
    }

    async fn read_holding_registers(
        &self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, LinkError> {
        let mut guard = self.context.lock().await;
        let Some(ctx) = guard.as_mut() else {
            return Err(LinkError::not_connected());
        };

        let request = ctx.read_holding_registers(address, count);
        let result = match timeout(self.response_timeout, request).await {
            Ok(Ok(values)) => Ok(values),
            Ok(Err(e)) => Err(LinkError::from(e)),
            Err(_) => Err(LinkError::timeout(format!(
                "read of register {} timed out after {:?}",
                address, self.response_timeout
            ))),
        };
        result.map_err(|e| self.fail(&mut guard, e))
    }

    async fn write_register(&self, address: u16, value: u16) -> Result<(), LinkError> {
        let mut guard = self.context.lock().await;
        let Some(ctx) = guard.as_mut() else {
            return Err(LinkError::not_connected());
        };

        let request = ctx.write_single_register(address, value);
        let result = match timeout(self.response_timeout, request).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(LinkError::from(e)),
            Err(_) => Err(LinkError::timeout(format!(
                "write of register {} timed out after {:?}",
                address, self.response_timeout
            ))),
        };
        result.map_err(|e| self.fail(&mut guard, e))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn reconnect(&self) -> Result<(), LinkError> {
        self.disconnect().await;
        self.connect().await
    }
}
