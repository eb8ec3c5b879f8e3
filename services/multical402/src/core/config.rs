//! Service configuration
//!
//! Layered with figment: serialized defaults, then the config file (YAML,
//! TOML or JSON by extension), then `MC402_` environment variables with `__`
//! separating nested keys (`MC402_METER__MAX_RETRIES=3`).

use std::path::Path;
use std::time::Duration;

use common::serde_helpers::duration_str;
use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::sequencer::PollConfig;
use crate::error::{KmpError, Result};
use crate::protocols::kmp::{Destination, RegisterId};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "MC402_";

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub uart: UartConfig,
    pub meter: MeterConfig,
    pub sensors: SensorsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub log_level: String,
    pub log_dir: Option<String>,
    /// Also write daily rolling log files
    pub log_to_file: bool,
    /// Log file as JSON lines
    pub log_json: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "multical402".to_string(),
            log_level: "info".to_string(),
            log_dir: None,
            log_to_file: false,
            log_json: false,
        }
    }
}

/// Serial port settings, defaults match the optical reading head
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UartConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0", "COM1")
    pub port: String,
    pub baud_rate: u32,
    /// Data bits (5, 6, 7, 8)
    pub data_bits: u8,
    /// Stop bits (1, 2)
    pub stop_bits: u8,
    /// Parity ("None", "Even", "Odd")
    pub parity: String,
}

impl Default for UartConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 1200,
            data_bits: 8,
            stop_bits: 2,
            parity: "None".to_string(),
        }
    }
}

impl UartConfig {
    /// `simulate` skips the port path check
    pub fn validate(&self, simulate: bool) -> Result<()> {
        if !simulate && self.port.trim().is_empty() {
            return Err(KmpError::config("uart.port cannot be empty"));
        }

        if self.baud_rate == 0 {
            return Err(KmpError::config("uart.baud_rate must be greater than zero"));
        }

        if !(5..=8).contains(&self.data_bits) {
            return Err(KmpError::config("uart.data_bits must be 5, 6, 7, or 8"));
        }

        if ![1, 2].contains(&self.stop_bits) {
            return Err(KmpError::config("uart.stop_bits must be 1 or 2"));
        }

        if !["none", "even", "odd"].contains(&self.parity.to_lowercase().as_str()) {
            return Err(KmpError::config("uart.parity must be None, Even, or Odd"));
        }

        Ok(())
    }
}

/// Polling behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterConfig {
    pub destination: Destination,
    /// Time between poll cycles
    #[serde(with = "duration_str")]
    pub update_interval: Duration,
    /// Deadline for one request/response exchange
    #[serde(with = "duration_str")]
    pub response_timeout: Duration,
    /// Extra attempts per register before it is marked stale
    pub max_retries: u8,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            destination: Destination::HeatMeter,
            update_interval: Duration::from_secs(60),
            response_timeout: Duration::from_millis(200),
            max_retries: 2,
        }
    }
}

impl MeterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.update_interval.is_zero() {
            return Err(KmpError::config("meter.update_interval must be greater than zero"));
        }

        if self.response_timeout.is_zero() {
            return Err(KmpError::config("meter.response_timeout must be greater than zero"));
        }

        if self.response_timeout >= self.update_interval {
            return Err(KmpError::config(format!(
                "meter.response_timeout ({:?}) must be shorter than meter.update_interval ({:?})",
                self.response_timeout, self.update_interval
            )));
        }

        Ok(())
    }

    pub fn poll_config(&self) -> PollConfig {
        PollConfig {
            destination: self.destination,
            response_timeout: self.response_timeout,
            max_retries: self.max_retries,
        }
    }
}

/// One published sensor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Display name, defaults to the register label
    pub name: Option<String>,
}

/// Sensors to publish, a register is only polled when its sensor is present
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorsConfig {
    pub energy: Option<SensorConfig>,
    pub power: Option<SensorConfig>,
    pub temperature_in: Option<SensorConfig>,
    pub temperature_out: Option<SensorConfig>,
    pub temperature_diff: Option<SensorConfig>,
    pub flow: Option<SensorConfig>,
    pub volume: Option<SensorConfig>,
}

impl SensorsConfig {
    pub fn get(&self, register: RegisterId) -> Option<&SensorConfig> {
        match register {
            RegisterId::Energy => self.energy.as_ref(),
            RegisterId::Power => self.power.as_ref(),
            RegisterId::TempIn => self.temperature_in.as_ref(),
            RegisterId::TempOut => self.temperature_out.as_ref(),
            RegisterId::TempDiff => self.temperature_diff.as_ref(),
            RegisterId::Flow => self.flow.as_ref(),
            RegisterId::Volume => self.volume.as_ref(),
        }
    }

    /// Configured sensors in polling order
    pub fn enabled(&self) -> Vec<(RegisterId, &SensorConfig)> {
        RegisterId::ALL
            .iter()
            .filter_map(|&id| self.get(id).map(|sensor| (id, sensor)))
            .collect()
    }

    /// Every sensor enabled with its default name
    pub fn all() -> Self {
        Self {
            energy: Some(SensorConfig::default()),
            power: Some(SensorConfig::default()),
            temperature_in: Some(SensorConfig::default()),
            temperature_out: Some(SensorConfig::default()),
            temperature_diff: Some(SensorConfig::default()),
            flow: Some(SensorConfig::default()),
            volume: Some(SensorConfig::default()),
        }
    }
}

impl SensorConfig {
    pub fn display_name(&self, register: RegisterId) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| register.request().label.to_string())
    }
}

impl AppConfig {
    /// Defaults merged with an optional file and the environment
    pub fn figment(path: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));

        if let Some(path) = path {
            if !path.exists() {
                return Err(KmpError::config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }

            let extension = path
                .extension()
                .and_then(|s| s.to_str())
                .ok_or_else(|| KmpError::config("Invalid file extension"))?;

            figment = match extension {
                "json" => figment.merge(Json::file(path)),
                "toml" => figment.merge(Toml::file(path)),
                "yaml" | "yml" => figment.merge(Yaml::file(path)),
                _ => {
                    return Err(KmpError::config(format!(
                        "Unsupported config format: {}",
                        extension
                    )))
                },
            };
            debug!("Loading configuration from {}", path.display());
        }

        Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::from_figment(Self::figment(path)?)
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        figment
            .extract()
            .map_err(|e| KmpError::config(format!("Failed to parse config: {}", e)))
    }

    pub fn validate(&self, simulate: bool) -> Result<()> {
        self.uart.validate(simulate)?;
        self.meter.validate()?;
        Ok(())
    }
}
