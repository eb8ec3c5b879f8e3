//! Error handling for the Multical 402 service
//!
//! Frame, transport and decode errors are retried inside a poll cycle and
//! never escape it. Only configuration and port-open errors reach `main`.

use errors::{ErrorCategory, ServiceError, ServiceErrorTrait};
use thiserror::Error;

use crate::protocols::kmp::register::{RegisterId, Unit};

/// KMP protocol and transport errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum KmpError {
    /// Malformed byte stream (bad delimiters, dangling escape, overflow)
    #[error("Framing error: {0}")]
    Framing(String),

    /// CRC over the destuffed frame did not verify
    #[error("Checksum error: expected 0x{expected:04X}, got 0x{actual:04X}")]
    Checksum { expected: u16, actual: u16 },

    /// No complete frame before the response deadline
    #[error("Timeout waiting for {register} response after {waited_ms} ms")]
    Timeout { register: RegisterId, waited_ms: u64 },

    /// Frame verified but its payload does not match the register layout
    #[error("Malformed payload for {register}: {reason}")]
    MalformedPayload { register: RegisterId, reason: String },

    /// Value decoded with a unit outside the register's allow-list
    #[error("Unexpected unit {unit} for {register}")]
    UnexpectedUnit { register: RegisterId, unit: Unit },

    /// UART read/write/open failure
    #[error("UART error: {0}")]
    Io(String),

    /// Invalid component or port configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for the KMP core
pub type Result<T> = std::result::Result<T, KmpError>;

impl KmpError {
    pub fn framing(msg: impl Into<String>) -> Self {
        KmpError::Framing(msg.into())
    }

    pub fn malformed(register: RegisterId, reason: impl Into<String>) -> Self {
        KmpError::MalformedPayload {
            register,
            reason: reason.into(),
        }
    }

    pub fn io(msg: impl Into<String>) -> Self {
        KmpError::Io(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        KmpError::Config(msg.into())
    }
}

impl ServiceErrorTrait for KmpError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Framing(_) => "FRAMING_ERROR",
            Self::Checksum { .. } => "CHECKSUM_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::MalformedPayload { .. } => "MALFORMED_PAYLOAD",
            Self::UnexpectedUnit { .. } => "UNEXPECTED_UNIT",
            Self::Io(_) => "UART_ERROR",
            Self::Config(_) => "CONFIGURATION_ERROR",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Framing(_) | Self::MalformedPayload { .. } => ErrorCategory::Protocol,
            Self::Checksum { .. } => ErrorCategory::DataCorruption,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::UnexpectedUnit { .. } => ErrorCategory::Validation,
            Self::Io(_) => ErrorCategory::Connection,
            Self::Config(_) => ErrorCategory::Configuration,
        }
    }
}

impl From<std::io::Error> for KmpError {
    fn from(err: std::io::Error) -> Self {
        KmpError::Io(err.to_string())
    }
}

impl From<tokio_serial::Error> for KmpError {
    fn from(err: tokio_serial::Error) -> Self {
        KmpError::Io(err.to_string())
    }
}

impl From<KmpError> for ServiceError {
    fn from(err: KmpError) -> Self {
        match err {
            KmpError::Config(msg) => ServiceError::Configuration(msg),
            KmpError::Io(msg) => ServiceError::Communication(msg),
            KmpError::Timeout { register, .. } => ServiceError::Timeout(register.to_string()),
            other => ServiceError::Protocol {
                protocol: "kmp".to_string(),
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_frame_errors_are_retryable() {
        assert!(KmpError::framing("overflow").is_retryable());
        assert!(KmpError::Checksum {
            expected: 1,
            actual: 2
        }
        .is_retryable());
        assert!(KmpError::Timeout {
            register: RegisterId::Flow,
            waited_ms: 200
        }
        .is_retryable());
        assert!(KmpError::malformed(RegisterId::Energy, "short").is_retryable());
        assert!(KmpError::io("write failed").is_retryable());
    }

    #[test]
    fn test_diagnostics_are_not_retryable() {
        let anomaly = KmpError::UnexpectedUnit {
            register: RegisterId::Power,
            unit: Unit::Other(99),
        };
        assert!(!anomaly.is_retryable());
        assert_eq!(anomaly.log_level(), tracing::Level::INFO);
        assert!(!KmpError::config("no port").is_retryable());
    }

    #[test]
    fn test_checksum_display() {
        let err = KmpError::Checksum {
            expected: 0x31C3,
            actual: 0x0001,
        };
        assert_eq!(
            err.to_string(),
            "Checksum error: expected 0x31C3, got 0x0001"
        );
        assert_eq!(err.error_code(), "CHECKSUM_ERROR");
    }

    #[test]
    fn test_into_service_error() {
        let err: ServiceError = KmpError::config("baud rate must be > 0").into();
        assert_eq!(err.category(), ErrorCategory::Configuration);

        let err: ServiceError = KmpError::Timeout {
            register: RegisterId::Energy,
            waited_ms: 200,
        }
        .into();
        assert!(matches!(err, ServiceError::Timeout(ref r) if r == "energy"));
    }
}
