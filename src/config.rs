//! # Config Module
//!
//! Service configuration, stored as RON.
//!
//! A missing file means defaults. Every field is optional in the file;
//! command-line flags are applied on top by [`Config::apply_overrides`].
//!
//! ```ron
//! (
//!     serial: (port_name: Some("/dev/ttyACM0"), baud_rate: 9600),
//!     dataset_dir: "training_sets",
//!     predictor: (program: "python3", args: ["client/main.py"], timeout_secs: Some(600)),
//! )
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StationError};
use crate::serial::line::MAX_LINE_LEN;

/// Default configuration file path.
pub const CONFIG_FILE: &str = "config/station.ron";

/// Serial link parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// `None` picks the first port the host reports.
    pub port_name: Option<String>,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: String,
    /// Driver-level timeout handed to the port.
    pub timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: None,
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: "none".to_string(),
            timeout_ms: 2000,
        }
    }
}

/// How to launch the forecasting pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    pub program: String,
    pub args: Vec<String>,
    /// `None` waits for the pipeline indefinitely.
    pub timeout_secs: Option<u64>,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["client/main.py".to_string()],
            timeout_secs: None,
        }
    }
}

impl PredictorConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Whole service configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub serial: SerialConfig,
    pub dataset_dir: PathBuf,
    pub model_dir: PathBuf,
    /// Idle re-check period when no bytes are pending.
    pub poll_interval_ms: u64,
    /// Upper bound on one line read, keeps the loop responsive to shutdown.
    pub read_timeout_ms: u64,
    /// Longest accepted command line, terminator included.
    pub max_line_bytes: usize,
    /// Consecutive transport failures before an operational alert.
    pub transport_alert_threshold: u32,
    pub predictor: PredictorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            dataset_dir: PathBuf::from("training_sets"),
            model_dir: PathBuf::from("models"),
            poll_interval_ms: 50,
            read_timeout_ms: 2000,
            max_line_bytes: MAX_LINE_LEN,
            transport_alert_threshold: 5,
            predictor: PredictorConfig::default(),
        }
    }
}

/// Values given on the command line; `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub port_name: Option<String>,
    pub baud_rate: Option<u32>,
    pub dataset_dir: Option<PathBuf>,
}

impl Config {
    /// Loads `path`, falling back to defaults if the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(data) => {
                let config = Self::from_ron(path, &data)?;
                info!("Loaded configuration from {}", path.display());
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn from_ron(path: &Path, data: &str) -> Result<Self> {
        ron::from_str(data).map_err(|e| StationError::config_parse(path, e.to_string()))
    }

    pub fn apply_overrides(&mut self, overrides: Overrides) {
        if let Some(port_name) = overrides.port_name {
            self.serial.port_name = Some(port_name);
        }
        if let Some(baud_rate) = overrides.baud_rate {
            self.serial.baud_rate = baud_rate;
        }
        if let Some(dataset_dir) = overrides.dataset_dir {
            self.dataset_dir = dataset_dir;
        }
    }

    /// Checks the loop tunables. Serial values are checked when the port
    /// settings are built.
    pub fn validate(&self) -> Result<()> {
        if self.read_timeout_ms == 0 {
            return Err(StationError::invalid_config("read_timeout_ms must be positive"));
        }
        if self.max_line_bytes == 0 {
            return Err(StationError::invalid_config("max_line_bytes must be positive"));
        }
        if self.transport_alert_threshold == 0 {
            return Err(StationError::invalid_config(
                "transport_alert_threshold must be positive",
            ));
        }
        if self.predictor.program.trim().is_empty() {
            return Err(StationError::invalid_config("predictor.program is empty"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}
