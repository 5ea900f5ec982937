//! Error handling for the ventilation engine
//!
//! Variants map onto the engine's four recovery classes: transport failures
//! (connection/io/timeout) feed the reconnect state machine, protocol and
//! decode failures degrade a single register, configuration failures are
//! returned to the caller.

use errors::VentError;
use thiserror::Error;

/// Engine error type
#[derive(Error, Debug, Clone)]
pub enum VentSrvError {
    /// Invalid endpoint or service settings
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Connect refused, reset or peer closed (includes NotConnected)
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Socket-level read/write failure
    #[error("IO error: {0}")]
    IoError(String),

    /// No reply within the configured window
    #[error("Timeout error: {0}")]
    TimeoutError(String),

    /// Malformed frame or Modbus exception reply
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Unknown wire type or payload too short for it
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// Rejected caller input (unknown action, out-of-range value)
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Operation not allowed in the current lifecycle state
    #[error("State error: {0}")]
    StateError(String),
}

/// Result type alias for the engine
pub type Result<T> = std::result::Result<T, VentSrvError>;

impl VentSrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        VentSrvError::ConfigError(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        VentSrvError::ConnectionError(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        VentSrvError::IoError(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        VentSrvError::TimeoutError(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        VentSrvError::ProtocolError(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        VentSrvError::DecodeError(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        VentSrvError::ValidationError(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        VentSrvError::StateError(msg.into())
    }

    pub fn not_connected() -> Self {
        VentSrvError::ConnectionError("Not connected".to_string())
    }

    /// Transport-class failure: the socket is no longer trustworthy
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            VentSrvError::ConnectionError(_)
                | VentSrvError::IoError(_)
                | VentSrvError::TimeoutError(_)
        )
    }
}

// ============================================================================
// From implementations for external error types
// ============================================================================

impl From<std::io::Error> for VentSrvError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => VentSrvError::TimeoutError(err.to_string()),
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => VentSrvError::ConnectionError(err.to_string()),
            _ => VentSrvError::IoError(err.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for VentSrvError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        VentSrvError::TimeoutError(err.to_string())
    }
}

impl From<figment::Error> for VentSrvError {
    fn from(err: figment::Error) -> Self {
        VentSrvError::ConfigError(err.to_string())
    }
}

impl From<VentSrvError> for VentError {
    fn from(err: VentSrvError) -> Self {
        match err {
            VentSrvError::ConfigError(msg) => VentError::Configuration(msg),
            VentSrvError::ConnectionError(msg) => VentError::ConnectionFailed {
                endpoint: "modbus".to_string(),
                reason: msg,
            },
            VentSrvError::IoError(msg) => VentError::Io(std::io::Error::other(msg)),
            VentSrvError::TimeoutError(msg) => VentError::Timeout(msg),
            VentSrvError::ProtocolError(msg) | VentSrvError::DecodeError(msg) => {
                VentError::Modbus(msg)
            },
            VentSrvError::ValidationError(msg) => VentError::Validation(msg),
            VentSrvError::StateError(msg) => VentError::Internal(msg),
        }
    }
}
