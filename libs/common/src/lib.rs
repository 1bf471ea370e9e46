//! Shared service plumbing for hvacsrv
//!
//! Provides the pieces every long-running service process needs:
//! - logging initialisation (console + optional daily rolling file)
//! - graceful shutdown signal handling

pub mod logging;
pub mod shutdown;

pub use logging::{LogConfig, LogGuard, LoggingError};
pub use shutdown::wait_for_shutdown;
