//! Unified error handling for the meter services
//!
//! Services keep their own domain error enums (e.g. the KMP protocol error)
//! and expose a common interface through [`ServiceErrorTrait`]. The binary
//! edge folds everything into [`ServiceError`].

use thiserror::Error;

// ============================================================================
// ServiceError - Main error type
// ============================================================================

/// Main error type for service startup and the binary edge
#[derive(Debug, Error)]
pub enum ServiceError {
    // ======================================
    // Configuration Errors
    // ======================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // ======================================
    // Protocol & Communication Errors
    // ======================================
    #[error("Protocol error: {protocol}: {message}")]
    Protocol { protocol: String, message: String },

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Connection failed: {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    #[error("Timeout waiting for response from {0}")]
    Timeout(String),

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

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using ServiceError
pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    /// Process exit code for this error when it terminates the binary
    pub fn exit_code(&self) -> i32 {
        match self.category() {
            ErrorCategory::Configuration | ErrorCategory::Validation => 2,
            ErrorCategory::Connection | ErrorCategory::Network | ErrorCategory::Timeout => 3,
            _ => 1,
        }
    }
}

// Helper macros for creating errors
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::ServiceError::Configuration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::ServiceError::Configuration(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! protocol_error {
    ($protocol:expr, $msg:expr) => {
        $crate::ServiceError::Protocol {
            protocol: $protocol.to_string(),
            message: $msg.to_string(),
        }
    };
}

impl ServiceErrorTrait for ServiceError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::InvalidConfig { .. } => "INVALID_CONFIG",
            Self::Protocol { .. } => "PROTOCOL_ERROR",
            Self::Communication(_) => "COMMUNICATION_ERROR",
            Self::ConnectionFailed { .. } => "CONNECTION_FAILED",
            Self::Timeout(_) => "TIMEOUT",
            Self::Io(_) => "IO_ERROR",
            Self::StartupFailed(_) => "STARTUP_FAILED",
            Self::Runtime(_) => "RUNTIME_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Other(_) => "OTHER_ERROR",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) | Self::InvalidConfig { .. } => ErrorCategory::Configuration,
            Self::Protocol { .. } => ErrorCategory::Protocol,
            Self::Communication(_) => ErrorCategory::Network,
            Self::ConnectionFailed { .. } => ErrorCategory::Connection,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Io(_) | Self::StartupFailed(_) | Self::Runtime(_) | Self::Internal(_) => {
                ErrorCategory::Internal
            },
            Self::Other(_) => ErrorCategory::Unknown,
        }
    }
}

// ============================================================================
// Service Error Trait - Architectural layer
// ============================================================================

/// Error category enum - used for classification and retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    // Infrastructure layer
    Configuration,
    Network,
    Timeout,

    // Business logic layer
    Validation,

    // Protocol/communication layer
    Protocol,
    Connection,

    // System level
    Internal,
    DataCorruption,

    // Others
    Unknown,
}

/// Service error capability trait
///
/// Every domain error type in the workspace implements this so callers can
/// classify, log and retry errors without knowing the concrete enum.
pub trait ServiceErrorTrait: std::error::Error + Send + Sync + 'static {
    /// Get error code (for logs and diagnostics)
    fn error_code(&self) -> &'static str;

    /// Get error category (for classification)
    fn category(&self) -> ErrorCategory;

    /// Whether the error is retryable (default implementation is category-based)
    fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Network
                | ErrorCategory::Timeout
                | ErrorCategory::Connection
                | ErrorCategory::DataCorruption
                | ErrorCategory::Protocol
        )
    }

    /// Get log level
    fn log_level(&self) -> tracing::Level {
        use tracing::Level;
        match self.category() {
            ErrorCategory::Internal | ErrorCategory::Configuration => Level::ERROR,
            ErrorCategory::Network
            | ErrorCategory::Timeout
            | ErrorCategory::Connection
            | ErrorCategory::Protocol
            | ErrorCategory::DataCorruption => Level::WARN,
            ErrorCategory::Validation => Level::INFO,
            ErrorCategory::Unknown => Level::WARN,
        }
    }
}
