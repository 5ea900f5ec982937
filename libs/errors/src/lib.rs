//! Unified error handling for ventsrv binaries
//!
//! Engine crates keep their own fine-grained error enums; at the process edge
//! everything is folded into [`VentError`] so `main` has a single result type.

use thiserror::Error;

// ============================================================================
// VentError - Main error type
// ============================================================================

/// Process-level error type
#[derive(Debug, Error)]
pub enum VentError {
    // ======================================
    // Configuration Errors
    // ======================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ======================================
    // Protocol & Communication Errors
    // ======================================
    #[error("Connection failed: {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    #[error("Timeout waiting for response from {0}")]
    Timeout(String),

    #[error("Modbus error: {0}")]
    Modbus(String),

    // ======================================
    // Validation Errors
    // ======================================
    #[error("Validation failed: {0}")]
    Validation(String),

    // ======================================
    // File & I/O Errors
    // ======================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ======================================
    // Service & Runtime Errors
    // ======================================
    #[error("Service startup failed: {0}")]
    StartupFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using VentError
pub type VentResult<T> = Result<T, VentError>;

/// Coarse error classes used for exit codes and log grouping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Connection,
    Timeout,
    Protocol,
    Validation,
    Io,
    Internal,
}

impl VentError {
    /// Stable machine-readable code
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::ConnectionFailed { .. } => "CONNECTION_FAILED",
            Self::Timeout(_) => "TIMEOUT",
            Self::Modbus(_) => "MODBUS_ERROR",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::StartupFailed(_) => "STARTUP_FAILED",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Other(_) => "OTHER_ERROR",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::ConnectionFailed { .. } => ErrorCategory::Connection,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Modbus(_) => ErrorCategory::Protocol,
            Self::Validation(_) => ErrorCategory::Validation,
            Self::Io(_) => ErrorCategory::Io,
            Self::StartupFailed(_) | Self::Internal(_) | Self::Other(_) => {
                ErrorCategory::Internal
            },
        }
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self.category() {
            ErrorCategory::Configuration | ErrorCategory::Validation => 78,
            ErrorCategory::Connection | ErrorCategory::Timeout => 69,
            ErrorCategory::Io => 74,
            ErrorCategory::Protocol | ErrorCategory::Internal => 70,
        }
    }
}

/// Build a [`VentError::Configuration`] from a message or format string
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::VentError::Configuration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::VentError::Configuration(format!($fmt, $($arg)*))
    };
}
