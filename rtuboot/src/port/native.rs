//! Serial ports through the `serialport` crate.

use {
    crate::{
        error::{Error, Result},
        port::{Parity, Port, PortEnumerator, PortInfo, SerialConfig},
    },
    log::{debug, trace},
    serialport::{ClearBuffer, FlowControl, SerialPort, SerialPortType},
    std::io::{self, ErrorKind, Read, Write},
};

/// An open host serial port.
pub struct NativePort {
    /// `None` once closed.
    handle: Option<Box<dyn SerialPort>>,
    name: String,
}

impl NativePort {
    /// Open the port described by `config`, 8 data bits, 1 stop bit, no
    /// flow control.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let handle = serialport::new(&config.port_name, config.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(config.parity.into())
            .flow_control(FlowControl::None)
            .timeout(config.read_timeout)
            .open()?;

        debug!(
            "Opened {} ({} baud, {:?} parity)",
            config.port_name, config.baud_rate, config.parity
        );
        Ok(Self {
            handle: Some(handle),
            name: config.port_name.clone(),
        })
    }

    /// Open `port_name` as 8N1 at `baud_rate`.
    pub fn open_simple(port_name: &str, baud_rate: u32) -> Result<Self> {
        Self::open(&SerialConfig::new(port_name, baud_rate))
    }

    /// Second handle on the same device, e.g. for a listener thread.
    pub fn try_clone(&self) -> Result<Self> {
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| Error::Io(closed()))?
            .try_clone()?;
        Ok(Self {
            handle: Some(handle),
            name: self.name.clone(),
        })
    }

    fn handle(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.handle.as_mut().ok_or_else(closed)
    }
}

fn closed() -> io::Error {
    io::Error::new(ErrorKind::NotConnected, "serial port closed")
}

impl Port for NativePort {
    fn clear_input(&mut self) -> Result<()> {
        trace!("Discarding pending input on {}", self.name);
        self.handle()?.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<()> {
        if self.handle.take().is_some() {
            debug!("Closed {}", self.name);
        }
        Ok(())
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.handle()?.read(buf)
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.handle()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.handle()?.flush()
    }
}

/// Enumerates host serial ports.
pub struct NativePortEnumerator;

impl PortEnumerator for NativePortEnumerator {
    fn list_ports() -> Result<Vec<PortInfo>> {
        let mut ports: Vec<PortInfo> = serialport::available_ports()?
            .into_iter()
            .map(|p| match p.port_type {
                SerialPortType::UsbPort(usb) => PortInfo {
                    name: p.port_name,
                    vid: Some(usb.vid),
                    pid: Some(usb.pid),
                    manufacturer: usb.manufacturer,
                    product: usb.product,
                    serial_number: usb.serial_number,
                },
                _ => PortInfo {
                    name: p.port_name,
                    vid: None,
                    pid: None,
                    manufacturer: None,
                    product: None,
                    serial_number: None,
                },
            })
            .collect();

        ports.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(ports)
    }
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => Self::None,
            Parity::Even => Self::Even,
            Parity::Odd => Self::Odd,
        }
    }
}
