//! Serial link abstraction.
//!
//! Sessions only need a byte pipe that can drop stale input, so [`Port`] is
//! little more than `Read + Write`. The real device is [`NativePort`]; the
//! integration tests plug in a simulated bootloader instead.
//!
//! ```text
//! Flasher -> Transport (Session / ListenerSession) -> Port -> NativePort
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use rtuboot::port::Port;
//!
//! fn resend<P: Port>(port: &mut P, frame: &[u8]) -> rtuboot::Result<()> {
//!     port.clear_input()?;
//!     port.send(frame)
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

use std::io::{Read, Write};
use std::time::Duration;

use crate::config::DEFAULT_BAUD;
use crate::error::Result;

/// Per-read poll interval. The response timeout is enforced by the session.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// Character parity. Data bits are always 8, stop bits always 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// 8N1, what most bootloaders use.
    #[default]
    None,
    /// 8E1, the Modbus-RTU default.
    Even,
    /// 8O1.
    Odd,
}

/// How to open the serial line.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Device path or name ("/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Line speed.
    pub baud_rate: u32,
    /// Parity bit.
    pub parity: Parity,
    /// How long a single read may block.
    pub read_timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self::new("", DEFAULT_BAUD)
    }
}

impl SerialConfig {
    /// 8N1 line at `baud_rate` on `port_name`.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            parity: Parity::None,
            read_timeout: POLL_TIMEOUT,
        }
    }

    /// Set the parity bit.
    #[must_use]
    pub fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    /// Set the per-read poll interval.
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }
}

/// A serial port as reported by the operating system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Device path or name.
    pub name: String,
    /// USB vendor id.
    pub vid: Option<u16>,
    /// USB product id.
    pub pid: Option<u16>,
    /// USB manufacturer string.
    pub manufacturer: Option<String>,
    /// USB product string.
    pub product: Option<String>,
    /// USB serial number.
    pub serial_number: Option<String>,
}

impl PortInfo {
    /// Product or manufacturer string, `n/a` when neither is known.
    pub fn description(&self) -> &str {
        self.product
            .as_deref()
            .or(self.manufacturer.as_deref())
            .unwrap_or("n/a")
    }

    /// Hardware id in `USB VID:PID=xxxx:xxxx SER=...` form, `n/a` for
    /// non-USB ports.
    pub fn hwid(&self) -> String {
        let (Some(vid), Some(pid)) = (self.vid, self.pid) else {
            return "n/a".to_string();
        };
        match &self.serial_number {
            Some(serial) => format!("USB VID:PID={vid:04X}:{pid:04X} SER={serial}"),
            None => format!("USB VID:PID={vid:04X}:{pid:04X}"),
        }
    }
}

/// Byte pipe to the bootloader.
pub trait Port: Read + Write + Send {
    /// Drop bytes received but not yet read.
    fn clear_input(&mut self) -> Result<()>;

    /// Device name, for log messages.
    fn name(&self) -> &str;

    /// Release the device. Further I/O fails.
    fn close(&mut self) -> Result<()>;

    /// Write a whole frame and flush it onto the wire.
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        self.write_all(frame)?;
        self.flush()?;
        Ok(())
    }
}

/// Lists the serial ports of the host.
pub trait PortEnumerator {
    /// All ports, sorted by name.
    fn list_ports() -> Result<Vec<PortInfo>>;

    /// First port in name order, the default when none is given.
    fn first_port() -> Result<Option<PortInfo>> {
        Ok(Self::list_ports()?.into_iter().next())
    }
}

#[cfg(feature = "native")]
pub use native::{NativePort, NativePortEnumerator};
