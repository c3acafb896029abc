//! # Station Link
//!
//! Base-station side of a small weather telemetry network.
//!
//! Remote stations report temperatures over a serial link; this crate
//! appends them to per-station datasets, and on request runs an external
//! forecasting pipeline and sends the forecasts back down the link as
//! fixed-layout binary records.
//!
//! ## Architecture
//!
//! - [`serial`]: the line-oriented transport and the forecast wire record
//! - [`command`]: the inbound command grammar
//! - [`dataset`]: routing samples to append-only station files
//! - [`predictor`]: the out-of-process forecasting pipeline
//! - [`forecast`]: forecast day labels and delivery
//! - [`dispatch`]: the always-on control loop
//! - [`config`]: RON configuration
//! - [`error`]: error types for the service

pub mod command;
pub mod config;
pub mod dataset;
pub mod dispatch;
pub mod error;
pub mod forecast;
pub mod predictor;
pub mod serial;

/// Re-exports for convenience
pub mod prelude {
    pub use crate::command::{Command, StationSample};
    pub use crate::config::Config;
    pub use crate::dataset::DatasetRouter;
    pub use crate::dispatch::{BaseStation, DispatchLoop, ExitReason};
    pub use crate::error::*;
    pub use crate::serial::Transport;
}
