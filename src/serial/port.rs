use log::{info, warn};
use tokio::time::Duration;
use tokio_serial::SerialPortBuilderExt;
pub use tokio_serial::{
    DataBits, FlowControl, Parity, SerialPort, SerialPortInfo, SerialPortType, SerialStream,
    StopBits, available_ports,
};

use super::Transport;
use super::line::LineReader;
use crate::config::SerialConfig;
use crate::error::{Result, StationError, TransportError};

/// serial port baud rate
pub const COMMON_BAUD_RATES: &[u32] = &[
    4800, 9600, 19200, 38400, 57600, 115200, 230400, 460800, 500000, 576000, 921600, 1000000,
    1500000, 2000000,
];

/// serial port settings
#[derive(Clone, Debug, PartialEq)]
pub struct PortSettings {
    pub port_name: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
    pub flow_control: FlowControl,
    pub timeout: Duration,
}

impl PortSettings {
    /// Builds settings for `port_name` from the serial section of the config.
    pub fn from_config(port_name: impl Into<String>, config: &SerialConfig) -> Result<Self> {
        let data_bits = match config.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            8 => DataBits::Eight,
            other => {
                return Err(StationError::invalid_config(format!(
                    "data_bits must be 5..=8, got {other}"
                )));
            }
        };
        let stop_bits = match config.stop_bits {
            1 => StopBits::One,
            2 => StopBits::Two,
            other => {
                return Err(StationError::invalid_config(format!(
                    "stop_bits must be 1 or 2, got {other}"
                )));
            }
        };
        let parity = match config.parity.to_ascii_lowercase().as_str() {
            "none" => Parity::None,
            "odd" => Parity::Odd,
            "even" => Parity::Even,
            other => {
                return Err(StationError::invalid_config(format!(
                    "parity must be none, odd or even, got '{other}'"
                )));
            }
        };
        if config.baud_rate == 0 {
            return Err(StationError::invalid_config("baud_rate must be positive"));
        }
        if !COMMON_BAUD_RATES.contains(&config.baud_rate) {
            warn!("Unusual baud rate {}", config.baud_rate);
        }

        Ok(PortSettings {
            port_name: port_name.into(),
            baud_rate: config.baud_rate,
            data_bits,
            stop_bits,
            parity,
            flow_control: FlowControl::None,
            timeout: Duration::from_millis(config.timeout_ms),
        })
    }
}

/// Human readable one-liner for `--list-ports`.
pub fn describe_port(info: &SerialPortInfo) -> String {
    match &info.port_type {
        SerialPortType::UsbPort(usb) => format!(
            "{} (USB {:04x}:{:04x} {})",
            info.port_name,
            usb.vid,
            usb.pid,
            usb.product.as_deref().unwrap_or("unknown device")
        ),
        SerialPortType::PciPort => format!("{} (PCI)", info.port_name),
        SerialPortType::BluetoothPort => format!("{} (Bluetooth)", info.port_name),
        SerialPortType::Unknown => info.port_name.clone(),
    }
}

/// All serial ports visible to the host.
pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
    available_ports().map_err(|e| StationError::NoPort(e.to_string()))
}

/// Uses the configured port, or the first one the host reports.
pub fn resolve_port_name(configured: Option<&str>) -> Result<String> {
    if let Some(name) = configured {
        return Ok(name.to_string());
    }
    let ports = list_ports()?;
    match ports.first() {
        Some(port) => {
            info!("No port configured, using {}", describe_port(port));
            Ok(port.port_name.clone())
        }
        None => Err(StationError::NoPort(
            "none configured and none detected".to_string(),
        )),
    }
}

/// `tokio-serial` backed transport.
///
/// The port is released by [`Transport::close`] or, on any other exit
/// path, when the transport is dropped.
pub struct SerialTransport {
    port_name: String,
    lines: Option<LineReader<SerialStream>>,
}

impl SerialTransport {
    /// open serial port
    pub fn open(
        settings: &PortSettings,
        max_line_bytes: usize,
        read_timeout: Duration,
    ) -> Result<Self> {
        let stream = tokio_serial::new(settings.port_name.as_str(), settings.baud_rate)
            .data_bits(settings.data_bits)
            .parity(settings.parity)
            .stop_bits(settings.stop_bits)
            .flow_control(settings.flow_control)
            .timeout(settings.timeout)
            .open_native_async()
            .map_err(|e| StationError::port_open(&settings.port_name, e.to_string()))?;
        info!(
            "Opened serial port {} at {} baud",
            settings.port_name, settings.baud_rate
        );
        Ok(Self::from_stream(
            settings.port_name.clone(),
            stream,
            max_line_bytes,
            read_timeout,
        ))
    }

    /// Wraps an already open stream.
    pub fn from_stream(
        port_name: impl Into<String>,
        stream: SerialStream,
        max_line_bytes: usize,
        read_timeout: Duration,
    ) -> Self {
        Self {
            port_name: port_name.into(),
            lines: Some(LineReader::new(stream, max_line_bytes, read_timeout)),
        }
    }

    /// Name of the underlying device.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    fn lines(&mut self) -> std::result::Result<&mut LineReader<SerialStream>, TransportError> {
        self.lines.as_mut().ok_or(TransportError::Closed)
    }
}

impl Transport for SerialTransport {
    fn has_pending_bytes(&mut self) -> std::result::Result<bool, TransportError> {
        let lines = self.lines()?;
        if lines.has_buffered() {
            return Ok(true);
        }
        let waiting = lines
            .get_ref()
            .bytes_to_read()
            .map_err(|e| TransportError::read(e.to_string()))?;
        Ok(waiting > 0)
    }

    async fn read_line(&mut self) -> std::result::Result<Option<String>, TransportError> {
        self.lines()?.read_line().await
    }

    async fn write_bytes(&mut self, buffer: &[u8]) -> std::result::Result<(), TransportError> {
        self.lines()?.write_all(buffer).await
    }

    async fn close(&mut self) -> std::result::Result<(), TransportError> {
        if let Some(lines) = self.lines.take() {
            drop(lines);
            info!("Closed serial port {}", self.port_name);
        }
        Ok(())
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        if self.lines.is_some() {
            info!("Releasing serial port {}", self.port_name);
        }
    }
}
