//! `ventsrv` basic library
//!
//! Provides bootstrap functions shared by the ventsrv binaries, including:
//! - logging initialization (console + daily rolling file)
//! - shutdown signal handling
//! - service banner / metadata

pub mod logging;
pub mod service_bootstrap;
pub mod shutdown;

pub use logging::{LogConfig, LoggingConfig};
pub use service_bootstrap::ServiceInfo;

// Re-export common dependencies
pub use anyhow;
pub use tokio;
