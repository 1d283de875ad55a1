//! # rtuboot
//!
//! A client for microcontroller bootloaders that speak a Modbus-RTU style
//! framing over a half-duplex RS-485/RS-232 link.
//!
//! The crate covers:
//!
//! - CRC-16/MODBUS and the `[addr][cmd][payload][crc16]` frame codec
//! - The four bootloader commands (enter, exit, read chunk, write chunk)
//! - Request/response transports: a blocking [`Session`] and a
//!   [`ListenerSession`] with a background reader thread
//! - The [`Flasher`] transfer engine: test, read, verify, program
//!
//! ## Features
//!
//! - `native` (default): serial port support through the `serialport` crate
//! - `serde`: Serialization support for [`MemoryRange`]
//!
//! ## Example
//!
//! ```rust,no_run
//! # #[cfg(feature = "native")]
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use rtuboot::{Flasher, MemoryRange, NativePort, Session};
//! use std::fs::File;
//!
//! let port = NativePort::open_simple("/dev/ttyUSB0", 115200)?;
//! let mut flasher = Flasher::new(Session::new(port, 1)?);
//!
//! flasher.test()?;
//!
//! let mut out = File::create("dump.bin")?;
//! flasher.read(MemoryRange::default(), &mut out, |_, _| {})?;
//! flasher.close()?;
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "native"))]
//! # fn main() {}
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod flasher;
pub mod image;
pub mod port;
pub mod protocol;
pub mod session;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use {
    config::{BootConfig, CHUNK_SIZE, FLASH_BASE, MAGIC, MEMORY_END, MEMORY_START, MemoryRange},
    error::{Error, FrameError, Result},
    flasher::{ChunkWriteError, Flasher, ProgramReport, VerifyMismatch, VerifyReport},
    image::FirmwareImage,
    port::{Parity, Port, PortEnumerator, PortInfo, SerialConfig},
    protocol::{Command, Opcode, WriteStatus, crc16_modbus},
    session::{ListenerSession, Session, Transport},
};
