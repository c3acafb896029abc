//! # Error Module
//!
//! This module provides the error types for the `station_link` service.
//! It uses the `thiserror` crate for ergonomic error handling.
//!
//! Only [`StationError`] ever leaves `main`. The other types are recovered
//! inside one iteration of the dispatch loop and end up in the log.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for `station_link` operations.
pub type Result<T> = std::result::Result<T, StationError>;

/// Main error type for the `station_link` service.
#[derive(Debug, Error)]
pub enum StationError {
    /// Failed to open serial port.
    #[error("Failed to open serial port '{port_name}': {reason}")]
    PortOpen { port_name: String, reason: String },

    /// No serial port was configured and none could be discovered.
    #[error("No serial port available: {0}")]
    NoPort(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration file could not be parsed.
    #[error("Failed to parse config file '{path}': {reason}")]
    ConfigParse { path: PathBuf, reason: String },

    /// File I/O error.
    #[error("File I/O error: {0}")]
    FileIo(#[from] std::io::Error),

    /// Transport failure outside the dispatch loop (open/close).
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl StationError {
    /// Creates a new port open error.
    #[must_use]
    pub fn port_open(port_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PortOpen {
            port_name: port_name.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new invalid configuration error.
    #[must_use]
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Creates a new config parse error.
    #[must_use]
    pub fn config_parse(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::ConfigParse {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// A field of the `receive` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    StationId,
    Year,
    Month,
    Day,
    Hour,
    Temperature,
}

impl Field {
    /// Fields in wire order, after the `receive` keyword.
    pub const ORDER: [Field; 6] = [
        Field::StationId,
        Field::Year,
        Field::Month,
        Field::Day,
        Field::Hour,
        Field::Temperature,
    ];

    /// Name used in log lines and malformed reasons.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Field::StationId => "station_id",
            Field::Year => "year",
            Field::Month => "month",
            Field::Day => "day",
            Field::Hour => "hour",
            Field::Temperature => "temperature",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a command line could not be classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Nothing but whitespace on the line.
    #[error("empty line")]
    Empty,

    /// Neither `run` nor `receive`.
    #[error("unknown command")]
    UnknownCommand,

    /// The line ended before this field.
    #[error("{0}")]
    MissingField(Field),

    /// The field was present but did not validate.
    #[error("{0}")]
    InvalidField(Field),
}

impl ParseError {
    /// The offending field, when there is one.
    #[must_use]
    pub fn field(&self) -> Option<Field> {
        match self {
            ParseError::MissingField(field) | ParseError::InvalidField(field) => Some(*field),
            ParseError::Empty | ParseError::UnknownCommand => None,
        }
    }
}

/// Dataset routing failures. The sample is dropped.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Station address maps to an index below 1.
    #[error("Invalid station {station_id}: logical index {index} is below 1")]
    InvalidStation { station_id: u32, index: i64 },

    /// Dataset file could not be opened or written.
    #[error("Dataset I/O failure on '{path}': {source}")]
    IoFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RouterError {
    /// Creates a new I/O failure for the given dataset path.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoFailure {
            path: path.into(),
            source,
        }
    }
}

/// Serial link failures. Recovered on the next poll iteration.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to read from serial port.
    #[error("Failed to read from serial port: {0}")]
    Read(String),

    /// Failed to write to serial port.
    #[error("Failed to write to serial port: {0}")]
    Write(String),

    /// A line ran past the length cap and was discarded.
    #[error("Line longer than {limit} bytes discarded")]
    LineTooLong { limit: usize },

    /// The link has already been released.
    #[error("Serial port is closed")]
    Closed,
}

impl TransportError {
    /// Creates a new read error.
    #[must_use]
    pub fn read(msg: impl Into<String>) -> Self {
        Self::Read(msg.into())
    }

    /// Creates a new write error.
    #[must_use]
    pub fn write(msg: impl Into<String>) -> Self {
        Self::Write(msg.into())
    }
}

/// Prediction subprocess failures. No records are sent for that station.
#[derive(Debug, Error)]
pub enum PredictorError {
    /// The predictor process could not be started or awaited.
    #[error("Failed to run predictor '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The predictor exited unsuccessfully.
    #[error("Predictor exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },

    /// The predictor's stdout was not a usable forecast.
    #[error("Invalid predictor output: {0}")]
    Output(String),

    /// The predictor ran past its deadline and was killed.
    #[error("Predictor timed out after {0:?}")]
    Timeout(Duration),
}

impl PredictorError {
    /// Creates a new output error.
    #[must_use]
    pub fn output(msg: impl Into<String>) -> Self {
        Self::Output(msg.into())
    }
}
