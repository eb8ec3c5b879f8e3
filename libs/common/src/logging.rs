//! Unified logging module for the meter services
//!
//! Console output uses a compact `timestamp [LEVEL] message` format. An
//! optional daily-rolling file layer writes the same events to
//! `{log_dir}/{service}.log.YYYY-MM-DD`.

use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{
        self,
        format::{FmtSpan, Writer},
        FmtContext, FormatEvent, FormatFields,
    },
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Custom format for log level with brackets: `[INFO]`, `[WARN]`, etc.
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Custom event formatter that outputs: `timestamp [LEVEL] message`
///
/// Example output: `2026-10-18T06:00:00.000000Z [INFO] Energy: 123.456 MWh`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m", // magenta
                Level::DEBUG => "\x1b[34m", // blue
                Level::INFO => "\x1b[32m",  // green
                Level::WARN => "\x1b[33m",  // yellow
                Level::ERROR => "\x1b[31m", // red
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

// Keeps the non-blocking file writer alive for the life of the process
static GUARDS: OnceLock<Mutex<Vec<WorkerGuard>>> = OnceLock::new();

// ============================================================================
// Log Root Directory Configuration
// ============================================================================

/// Environment variable overriding the log root directory
pub const LOG_DIR_ENV: &str = "MC402_LOG_DIR";

static LOG_ROOT: OnceLock<PathBuf> = OnceLock::new();

/// Initialize log root directory from config or environment
///
/// Priority:
/// 1. `MC402_LOG_DIR` environment variable (highest)
/// 2. `config_dir` parameter (from the service config file)
/// 3. Default value "logs" (lowest)
pub fn init_log_root(config_dir: Option<&str>) {
    LOG_ROOT.get_or_init(|| {
        std::env::var(LOG_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                config_dir
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("logs"))
            })
    });
}

/// Get log root directory, falling back to env or "logs" when not initialized
pub fn get_log_root() -> PathBuf {
    LOG_ROOT.get().cloned().unwrap_or_else(|| {
        std::env::var(LOG_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("logs"))
    })
}

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name, also used as the file name prefix
    pub service_name: String,
    /// Base directory for log files
    pub log_dir: PathBuf,
    /// Console log level (overridden by `RUST_LOG`)
    pub console_level: Level,
    /// Write a daily rolling log file in addition to the console
    pub enable_file: bool,
    /// Write the file layer as JSON lines
    pub enable_json: bool,
    /// Colored console output
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".to_string(),
            log_dir: get_log_root(),
            console_level: Level::INFO,
            enable_file: false,
            enable_json: false,
            ansi: true,
        }
    }
}

/// Build the filter directive. `RUST_LOG` wins when set and non-empty.
fn filter_directive(rust_log: Option<String>, config: &LogConfig) -> String {
    match rust_log {
        Some(env_str) if !env_str.trim().is_empty() => env_str,
        _ => {
            let level = config.console_level.as_str().to_lowercase();
            format!("{},{}={}", level, config.service_name, level)
        },
    }
}

/// Initialize logging system with configuration
pub fn init_with_config(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let directive = filter_directive(std::env::var("RUST_LOG").ok(), &config);
    let env_filter = EnvFilter::try_new(&directive)?;

    let console_layer = fmt::layer()
        .with_ansi(config.ansi)
        .event_format(BracketedLevelFormat)
        .boxed();

    let file_layer = if config.enable_file {
        std::fs::create_dir_all(&config.log_dir)?;
        let appender = tracing_appender::rolling::daily(
            &config.log_dir,
            format!("{}.log", config.service_name),
        );
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        let guards = GUARDS.get_or_init(|| Mutex::new(Vec::new()));
        match guards.lock() {
            Ok(mut guards) => guards.push(guard),
            Err(poisoned) => {
                eprintln!("Warning: GUARDS lock was poisoned, recovering...");
                poisoned.into_inner().push(guard);
            },
        }

        let layer = if config.enable_json {
            fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_level(true)
                .with_target(true)
                .with_span_events(FmtSpan::CLOSE)
                .boxed()
        } else {
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .event_format(BracketedLevelFormat)
                .boxed()
        };
        Some(layer)
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    if config.enable_file {
        tracing::info!("Logging: {} @ {:?}", config.service_name, config.log_dir);
    }
    tracing::debug!("Log filter: {}", directive);

    Ok(())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_format_level() {
        assert_eq!(format_level(&Level::INFO), "[INFO]");
        assert_eq!(format_level(&Level::WARN), "[WARN]");
        assert_eq!(format_level(&Level::TRACE), "[TRACE]");
    }

    #[test]
    fn test_filter_directive_prefers_rust_log() {
        let config = LogConfig {
            service_name: "multical402".into(),
            console_level: Level::WARN,
            ..Default::default()
        };
        assert_eq!(
            filter_directive(Some("trace".into()), &config),
            "trace".to_string()
        );
        assert_eq!(
            filter_directive(Some("  ".into()), &config),
            "warn,multical402=warn"
        );
        assert_eq!(filter_directive(None, &config), "warn,multical402=warn");
    }

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.console_level, Level::INFO);
        assert!(!config.enable_file);
        assert!(config.ansi);
    }
}
