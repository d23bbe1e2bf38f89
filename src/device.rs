//! Descriptions of serial ports, the predicate that decides which of them
//! are radios, and the traits that hide the actual serial hardware.
//!
//! Enumeration goes through [serialport], since it is the crate that knows
//! about USB vendor and product ids; the ports themselves are driven with
//! [serial2], whose `&self` read/write lets a reader thread and the command
//! path share one handle without locking.

use crate::config::SerialConfig;
use log::debug;
use std::{io, sync::Arc};

/// One serial port as reported by the operating system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Stable identifier used to open the port, e.g. `/dev/ttyUSB0`.
    pub name: String,
    /// Human readable description, usually the USB product string.
    pub description: String,
    /// USB vendor and product id.
    pub usb_id: Option<(u16, u16)>,
}

impl PortInfo {
    /// The `vid:pid` string in lowercase hex, or an empty string for ports
    /// that are not USB devices.
    pub fn vid_pid(&self) -> String {
        match self.usb_id {
            Some((vid, pid)) => format!("{:04x}:{:04x}", vid, pid),
            None => String::new(),
        }
    }
}

/// Decides whether a port looks like a compatible radio. Kept separate from
/// discovery so new hardware signatures can be added without touching it.
pub trait DeviceClassifier: Send + Sync {
    /// True when `port` should be opened.
    fn is_compatible(&self, port: &PortInfo) -> bool;
}

/// Matches a list of case-insensitive substrings against the description and
/// the `vid:pid` string of a port.
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    keywords: Vec<String>,
}

impl KeywordClassifier {
    /// Build a classifier from an allow-list.
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().to_lowercase())
                .collect(),
        }
    }
}

impl DeviceClassifier for KeywordClassifier {
    fn is_compatible(&self, port: &PortInfo) -> bool {
        let description = port.description.to_lowercase();
        let vid_pid = port.vid_pid();
        self.keywords
            .iter()
            .any(|k| description.contains(k.as_str()) || vid_pid.contains(k.as_str()))
    }
}

/// An open, bidirectional byte link to one radio.
///
/// Reads block for at most the configured read timeout and report an
/// expired timeout as [io::ErrorKind::TimedOut].
pub trait SerialLink: Send + Sync {
    /// Read whatever is available into `buf`.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;
    /// Write the whole buffer.
    fn write_all(&self, buf: &[u8]) -> io::Result<()>;
    /// Push buffered output to the device.
    fn flush(&self) -> io::Result<()>;
}

impl SerialLink for serial2::SerialPort {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        serial2::SerialPort::read(self, buf)
    }

    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        serial2::SerialPort::write_all(self, buf)
    }

    fn flush(&self) -> io::Result<()> {
        serial2::SerialPort::flush(self)
    }
}

/// The source of ports: enumerates them and opens them.
pub trait SerialBackend: Send + Sync {
    /// All serial ports currently present on the host.
    fn list_ports(&self) -> io::Result<Vec<PortInfo>>;
    /// Open `port` with the given settings.
    fn open(&self, port: &PortInfo, config: &SerialConfig) -> io::Result<Arc<dyn SerialLink>>;
}

/// The real serial hardware of this machine.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSerial;

impl SerialBackend for SystemSerial {
    fn list_ports(&self) -> io::Result<Vec<PortInfo>> {
        let ports = serialport::available_ports().map_err(io::Error::from)?;
        Ok(ports
            .into_iter()
            .map(|p| match p.port_type {
                serialport::SerialPortType::UsbPort(usb) => PortInfo {
                    description: usb
                        .product
                        .or(usb.manufacturer)
                        .unwrap_or_else(|| "n/a".to_owned()),
                    usb_id: Some((usb.vid, usb.pid)),
                    name: p.port_name,
                },
                other => {
                    debug!("{} is not a USB port ({:?})", p.port_name, other);
                    PortInfo {
                        description: "n/a".to_owned(),
                        usb_id: None,
                        name: p.port_name,
                    }
                }
            })
            .collect())
    }

    fn open(&self, port: &PortInfo, config: &SerialConfig) -> io::Result<Arc<dyn SerialLink>> {
        let mut serial = serial2::SerialPort::open(&port.name, config.baud_rate)?;
        serial.set_read_timeout(config.read_timeout())?;
        serial.set_write_timeout(std::time::Duration::from_secs(2))?;
        Ok(Arc::new(serial))
    }
}
