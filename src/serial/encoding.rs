//! # Encoding Module
//!
//! Fixed-layout binary record for forecasts sent to the display device.
//! The receiver hard-codes this layout, so it must not change.
//!
//! ```text
//! offset size field
//!      0    4 station index, u32 little-endian
//!      4   10 weekday name, ASCII, NUL padded
//!     14    2 padding, zero
//!     16    8 prediction in degrees Celsius, IEEE-754 binary64 bit
//!             pattern as u64 little-endian
//! ```
//!
//! The prediction travels as the raw bits of the `f64`, so a decoded record
//! carries exactly the value the predictor produced.

use log::error;

/// Encoded size of one record.
pub const RECORD_LEN: usize = 24;

/// Width of the weekday field.
pub const DAY_FIELD_LEN: usize = 10;

const DAY_OFFSET: usize = 4;
const VALUE_OFFSET: usize = 16;

/// One predicted value for one station on one day.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastRecord {
    pub station_index: u32,
    /// ASCII, at most [`DAY_FIELD_LEN`] bytes.
    pub day: String,
    /// Degrees Celsius.
    pub value: f64,
}

impl ForecastRecord {
    /// Builds a record from a prediction in degrees Celsius.
    ///
    /// The day label is truncated to the field width.
    ///
    /// # Examples
    ///
    /// ```
    /// use station_link::serial::encoding::ForecastRecord;
    ///
    /// let record = ForecastRecord::new(1, "Wednesday", 18.537);
    /// let decoded = ForecastRecord::decode(&record.encode()).unwrap();
    /// assert_eq!(decoded.day, "Wednesday");
    /// assert_eq!(decoded.value, 18.537);
    /// ```
    #[must_use]
    pub fn new(station_index: u32, day: &str, value: f64) -> Self {
        let day: String = day
            .chars()
            .filter(char::is_ascii)
            .take(DAY_FIELD_LEN)
            .collect();
        Self {
            station_index,
            day,
            value,
        }
    }

    #[must_use]
    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut buf = [0u8; RECORD_LEN];
        buf[..DAY_OFFSET].copy_from_slice(&self.station_index.to_le_bytes());
        let day = self.day.as_bytes();
        let len = day.len().min(DAY_FIELD_LEN);
        buf[DAY_OFFSET..DAY_OFFSET + len].copy_from_slice(&day[..len]);
        buf[VALUE_OFFSET..].copy_from_slice(&self.value.to_bits().to_le_bytes());
        buf
    }

    /// Reads one record. Returns `None` for a short buffer or a non-ASCII day.
    #[must_use]
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let buf: &[u8; RECORD_LEN] = buf.get(..RECORD_LEN)?.try_into().ok()?;
        let station_index = u32::from_le_bytes(buf[..DAY_OFFSET].try_into().ok()?);
        let day_field = &buf[DAY_OFFSET..DAY_OFFSET + DAY_FIELD_LEN];
        let end = day_field
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(DAY_FIELD_LEN);
        let day = match std::str::from_utf8(&day_field[..end]) {
            Ok(day) if day.is_ascii() => day.to_string(),
            _ => {
                error!("Forecast record has a non-ASCII day field");
                return None;
            }
        };
        let bits = u64::from_le_bytes(buf[VALUE_OFFSET..].try_into().ok()?);
        Some(Self {
            station_index,
            day,
            value: f64::from_bits(bits),
        })
    }
}

/// Decodes back-to-back records; a trailing partial record is ignored.
#[must_use]
pub fn decode_records(bytes: &[u8]) -> Vec<ForecastRecord> {
    bytes
        .chunks_exact(RECORD_LEN)
        .filter_map(ForecastRecord::decode)
        .collect()
}
