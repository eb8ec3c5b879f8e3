//! Basic library shared by the meter services
//!
//! Provides:
//! - logging initialization
//! - startup banner and bootstrap arguments
//! - graceful shutdown signal handling
//! - serde helpers for configuration files
//! - hex formatting for wire traces

pub mod bootstrap_args;
pub mod hex;
pub mod logging;
pub mod serde_helpers;
pub mod service_bootstrap;
pub mod shutdown;

// Re-export common dependencies
pub use anyhow;
pub use serde;
pub use tokio;

// Re-export CLI dependencies when cli feature is enabled
#[cfg(feature = "cli")]
pub use clap;
