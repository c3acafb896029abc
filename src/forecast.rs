//! # Forecast Module
//!
//! Turns predictor output into wire records and pushes them down the link.

use chrono::{DateTime, Days, Local, NaiveDate};
use log::{debug, info};

use crate::error::TransportError;
use crate::serial::Transport;
use crate::serial::encoding::{ForecastRecord, RECORD_LEN};

/// Source of the forecast issue time.
pub trait Clock {
    fn now(&self) -> DateTime<Local>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Predicted temperatures for one station, one value per future day.
#[derive(Debug, Clone, PartialEq)]
pub struct Forecast {
    pub station_index: u32,
    pub values: Vec<f64>,
    /// Day of the first predicted step.
    pub issued: NaiveDate,
}

impl Forecast {
    pub fn new(station_index: u32, values: Vec<f64>, issued: NaiveDate) -> Self {
        Self {
            station_index,
            values,
            issued,
        }
    }

    /// English weekday name of step `step`, counted in days from `issued`.
    pub fn day_label(&self, step: usize) -> String {
        u64::try_from(step)
            .ok()
            .and_then(|days| self.issued.checked_add_days(Days::new(days)))
            .map(|date| date.format("%A").to_string())
            .unwrap_or_default()
    }

    /// Wire records in step order.
    pub fn records(&self) -> Vec<ForecastRecord> {
        self.values
            .iter()
            .enumerate()
            .map(|(step, value)| {
                ForecastRecord::new(self.station_index, &self.day_label(step), *value)
            })
            .collect()
    }
}

/// Serialises forecasts onto the transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForecastSender;

impl ForecastSender {
    /// Sends every record of `forecast` in one write. Returns the record count.
    pub async fn send<T: Transport>(
        &self,
        transport: &mut T,
        forecast: &Forecast,
    ) -> Result<usize, TransportError> {
        let records = forecast.records();
        let mut buffer = Vec::with_capacity(records.len() * RECORD_LEN);
        for record in &records {
            let bytes = record.encode();
            debug!(
                "Station {} {} -> {}",
                record.station_index,
                record.day,
                hex::encode(bytes)
            );
            buffer.extend_from_slice(&bytes);
        }
        transport.write_bytes(&buffer).await?;
        info!(
            "Sent {} forecast records for station {}",
            records.len(),
            forecast.station_index
        );
        Ok(records.len())
    }
}
