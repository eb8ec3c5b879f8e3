//! Common command-line arguments for the meter services
//!
//! Provides a unified argument structure that individual services flatten
//! into their own `clap` parser.

#[cfg(feature = "cli")]
use clap::Args;

/// Common service startup arguments
#[derive(Debug, Clone)]
#[cfg_attr(feature = "cli", derive(Args))]
pub struct ServiceArgs {
    /// Log level (trace, debug, info, warn, error)
    #[cfg_attr(
        feature = "cli",
        arg(short = 'l', long, default_value = "info", env = "MC402_LOG_LEVEL")
    )]
    pub log_level: String,

    /// Enable debug mode with verbose output
    #[cfg_attr(feature = "cli", arg(long, env = "DEBUG"))]
    pub debug: bool,

    /// Disable colored output (useful for log files)
    #[cfg_attr(feature = "cli", arg(long))]
    pub no_color: bool,

    /// Only validate configuration without starting service
    #[cfg_attr(feature = "cli", arg(long))]
    pub validate: bool,
}

impl Default for ServiceArgs {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            debug: false,
            no_color: false,
            validate: false,
        }
    }
}

impl ServiceArgs {
    /// Parse log level string to tracing::Level
    pub fn parse_log_level(&self) -> tracing::Level {
        if self.debug {
            return tracing::Level::DEBUG;
        }
        match self.log_level.to_lowercase().as_str() {
            "trace" => tracing::Level::TRACE,
            "debug" => tracing::Level::DEBUG,
            "warn" | "warning" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        }
    }

    /// Effective level string handed to the logging bootstrap
    pub fn effective_log_level(&self) -> String {
        self.parse_log_level().as_str().to_lowercase()
    }
}
