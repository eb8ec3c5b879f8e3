//! Unified service bootstrap utilities
//!
//! Startup banner and logging initialization shared by the meter services.

use crate::logging::{self, LogConfig};
use tracing::{info, Level};

/// Service metadata for startup
pub struct ServiceInfo {
    /// Service name (e.g., "multical402")
    pub name: String,
    /// Service version
    pub version: String,
    /// Service description
    pub description: String,
}

impl ServiceInfo {
    /// Create new service info
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: description.into(),
        }
    }
}

/// Print unified startup banner
pub fn print_startup_banner(service: &ServiceInfo) {
    let banner = r#"
 ███╗   ███╗ ██████╗██╗  ██╗ ██████╗ ██████╗
 ████╗ ████║██╔════╝██║  ██║██╔═████╗╚════██╗
 ██╔████╔██║██║     ███████║██║██╔██║ █████╔╝
 ██║╚██╔╝██║██║     ╚════██║████╔╝██║██╔═══╝
 ██║ ╚═╝ ██║╚██████╗     ██║╚██████╔╝███████╗
 ╚═╝     ╚═╝ ╚═════╝     ╚═╝ ╚═════╝ ╚══════╝
    "#;

    info!("{}", banner);
    info!(" {} v{}", service.name.to_uppercase(), service.version);
    info!(" {}", service.description);
    info!("");
}

/// Logging options resolved from CLI arguments and the config file
#[derive(Debug, Clone)]
pub struct LoggingOptions<'a> {
    /// Level string from `--log-level` / config
    pub level: &'a str,
    /// Log directory from the config file
    pub log_dir: Option<&'a str>,
    /// Also write a daily rolling file
    pub to_file: bool,
    /// JSON lines in the log file
    pub json: bool,
    /// Colored console output
    pub ansi: bool,
}

/// Initialize logging for a service
///
/// Log root directory priority:
/// 1. MC402_LOG_DIR environment variable
/// 2. `options.log_dir`
/// 3. Default "logs"
pub fn init_logging(service: &ServiceInfo, options: &LoggingOptions<'_>) -> anyhow::Result<()> {
    logging::init_log_root(options.log_dir);

    let console_level = options.level.parse::<Level>().unwrap_or(Level::INFO);

    let log_config = LogConfig {
        service_name: service.name.clone(),
        log_dir: logging::get_log_root().join(&service.name),
        console_level,
        enable_file: options.to_file,
        enable_json: options.json,
        ansi: options.ansi,
    };

    logging::init_with_config(log_config).map_err(|e| anyhow::anyhow!("{}", e))?;

    Ok(())
}
