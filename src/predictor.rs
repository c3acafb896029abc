//! # Predictor Module
//!
//! The forecasting pipeline runs out of process so a slow or crashing
//! training run cannot disturb the serial link.
//!
//! The child is given no arguments beyond the configured ones. It finds its
//! inputs through the environment:
//!
//! | variable | value |
//! |---|---|
//! | `STATION_INDEX` | logical station index |
//! | `STATION_DATASET` | path of the station CSV |
//! | `STATION_DATASET_DIR` | dataset directory |
//! | `STATION_MODEL_DIR` | model directory |
//!
//! and must print the forecast as a JSON array of numbers on the last
//! non-empty line of stdout.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use log::{debug, warn};
use tokio::process::Command;
use tokio::time;

use crate::config::Config;
use crate::dataset::StationDataset;
use crate::error::PredictorError;

/// Produces a forecast from a station's history.
#[allow(async_fn_in_trait)]
pub trait Predictor {
    async fn produce_forecast(
        &mut self,
        dataset: &StationDataset,
    ) -> Result<Vec<f64>, PredictorError>;
}

/// Runs the forecasting pipeline as a child process per station.
#[derive(Debug, Clone)]
pub struct SubprocessPredictor {
    program: String,
    args: Vec<String>,
    dataset_dir: PathBuf,
    model_dir: PathBuf,
    timeout: Option<Duration>,
}

impl SubprocessPredictor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            dataset_dir: PathBuf::new(),
            model_dir: PathBuf::new(),
            timeout: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.predictor.program, config.predictor.args.clone())
            .with_dirs(&config.dataset_dir, &config.model_dir)
            .with_timeout(config.predictor.timeout())
    }

    #[must_use]
    pub fn with_dirs(mut self, dataset_dir: impl Into<PathBuf>, model_dir: impl Into<PathBuf>) -> Self {
        self.dataset_dir = dataset_dir.into();
        self.model_dir = model_dir.into();
        self
    }

    /// The child is killed once `timeout` expires.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn spawn_error(&self, source: std::io::Error) -> PredictorError {
        PredictorError::Spawn {
            program: self.program.clone(),
            source,
        }
    }
}

impl Predictor for SubprocessPredictor {
    async fn produce_forecast(
        &mut self,
        dataset: &StationDataset,
    ) -> Result<Vec<f64>, PredictorError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("STATION_INDEX", dataset.index.to_string())
            .env("STATION_DATASET", &dataset.path)
            .env("STATION_DATASET_DIR", &self.dataset_dir)
            .env("STATION_MODEL_DIR", &self.model_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(
            "Spawning predictor {} {:?} for station {}",
            self.program, self.args, dataset.index
        );
        let child = command.spawn().map_err(|e| self.spawn_error(e))?;

        let output = match self.timeout {
            Some(limit) => time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| PredictorError::Timeout(limit))?,
            None => child.wait_with_output().await,
        }
        .map_err(|e| self.spawn_error(e))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(PredictorError::Exit {
                status: output.status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }
        if !stderr.trim().is_empty() {
            debug!("Predictor stderr: {}", stderr.trim());
        }
        parse_forecast(&output.stdout)
    }
}

/// Reads the forecast from the last non-empty stdout line.
pub fn parse_forecast(stdout: &[u8]) -> Result<Vec<f64>, PredictorError> {
    let text = String::from_utf8_lossy(stdout);
    let Some(line) = text.lines().rev().map(str::trim).find(|line| !line.is_empty()) else {
        return Err(PredictorError::output("no output"));
    };
    let values: Vec<f64> =
        serde_json::from_str(line).map_err(|e| PredictorError::output(format!("{e}: {line}")))?;
    if values.is_empty() {
        return Err(PredictorError::output("empty forecast"));
    }
    if let Some(bad) = values.iter().find(|value| !value.is_finite()) {
        warn!("Predictor returned non-finite value {bad}");
        return Err(PredictorError::output("non-finite value"));
    }
    Ok(values)
}
