//! # Command Module
//!
//! Classifies one line received on the serial link.
//!
//! The inbound protocol is ASCII, newline terminated:
//!
//! ```text
//! run
//! receive-<id>-<year>-<month>-<day>-<hour>-<temperature>
//! ```
//!
//! Parsing never fails with an error the caller has to handle: anything that
//! does not match the grammar becomes [`Command::Malformed`] carrying a
//! [`ParseError`] that names the offending field.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Field, ParseError};

/// Keyword of the forecast trigger.
pub const RUN_KEYWORD: &str = "run";

/// Keyword of the sample upload.
pub const RECEIVE_KEYWORD: &str = "receive";

/// Field separator of the `receive` command.
pub const FIELD_SEPARATOR: char = '-';

/// Keyword plus six fields. The last token keeps the rest of the line so a
/// negative temperature survives the split.
const RECEIVE_TOKENS: usize = 7;

static DIGITS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+$").expect("Invalid regex pattern"));

/// One temperature reading reported by a remote station.
#[derive(Debug, Clone, PartialEq)]
pub struct StationSample {
    /// Hardware address of the station, `>= 8` for real stations.
    pub station_id: u32,
    pub year: String,
    pub month: String,
    pub day: String,
    pub hour: String,
    pub temperature: f64,
}

/// A classified command line.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Produce and transmit forecasts for every known station.
    Run,
    /// Append a sample to its station dataset.
    Receive(StationSample),
    /// Anything that did not parse.
    Malformed(ParseError),
}

impl Command {
    /// Parses one raw line. Trailing newline and surrounding whitespace are ignored.
    ///
    /// # Examples
    ///
    /// ```
    /// use station_link::command::Command;
    ///
    /// assert_eq!(Command::parse("run\r\n"), Command::Run);
    ///
    /// let Command::Receive(sample) = Command::parse("receive-8-2024-01-15-13-21.5") else {
    ///     panic!("expected a sample");
    /// };
    /// assert_eq!(sample.station_id, 8);
    /// assert_eq!(sample.temperature, 21.5);
    /// ```
    #[must_use]
    pub fn parse(line: &str) -> Self {
        match parse_line(line) {
            Ok(command) => command,
            Err(reason) => Command::Malformed(reason),
        }
    }

    /// Short name for log lines.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Command::Run => RUN_KEYWORD,
            Command::Receive(_) => RECEIVE_KEYWORD,
            Command::Malformed(_) => "malformed",
        }
    }
}

fn parse_line(line: &str) -> Result<Command, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ParseError::Empty);
    }
    if line == RUN_KEYWORD {
        return Ok(Command::Run);
    }

    let mut tokens = line.splitn(RECEIVE_TOKENS, FIELD_SEPARATOR);
    if tokens.next() != Some(RECEIVE_KEYWORD) {
        return Err(ParseError::UnknownCommand);
    }

    let mut fields = [""; 6];
    for (slot, field) in fields.iter_mut().zip(Field::ORDER) {
        *slot = tokens.next().ok_or(ParseError::MissingField(field))?.trim();
    }
    let [id, year, month, day, hour, temperature] = fields;

    Ok(Command::Receive(StationSample {
        station_id: id
            .parse()
            .map_err(|_| ParseError::InvalidField(Field::StationId))?,
        year: date_field(year, Field::Year)?,
        month: date_field(month, Field::Month)?,
        day: date_field(day, Field::Day)?,
        hour: date_field(hour, Field::Hour)?,
        temperature: temperature_field(temperature)?,
    }))
}

/// Calendar fields stay strings but must be plain digits, so they can never
/// smuggle a separator into the dataset row.
fn date_field(token: &str, field: Field) -> Result<String, ParseError> {
    if DIGITS.is_match(token) {
        Ok(token.to_string())
    } else {
        Err(ParseError::InvalidField(field))
    }
}

fn temperature_field(token: &str) -> Result<f64, ParseError> {
    match token.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(ParseError::InvalidField(Field::Temperature)),
    }
}
