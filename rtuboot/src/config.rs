//! Session configuration and protocol constants.
//!
//! [`BootConfig`] is built once (normally by the CLI) and handed to the
//! flasher by reference. Nothing in the library reads configuration from
//! ambient state.

use crate::error::{Error, Result};
use std::time::Duration;

/// Magic word exchanged by the enter-bootloader handshake.
pub const MAGIC: u32 = 0x1234_5678;

/// Base address of the target's flash.
///
/// An end address below this value is interpreted as a length.
pub const FLASH_BASE: u32 = 0x0800_0000;

/// Base address of the target's RAM.
pub const RAM_BASE: u32 = 0x2000_0000;

/// Default first application address (the bootloader occupies the first 4 KiB).
pub const MEMORY_START: u32 = 0x0800_1000;

/// Default end of the application area (exclusive).
pub const MEMORY_END: u32 = 0x0802_0000;

/// Bytes transferred per read/write command.
pub const CHUNK_SIZE: usize = 128;

/// Default baud rate.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Default response timeout, long enough to cover a flash page erase + write.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Attempts made for each enter/exit handshake.
pub const MAX_HANDSHAKE_ATTEMPTS: usize = 4;

/// Attempts made for each chunk write.
pub const MAX_WRITE_ATTEMPTS: usize = 5;

/// Verify stops after recording this many mismatching bytes.
pub const MAX_VERIFY_MISMATCHES: usize = 16;

/// Highest valid slave address.
pub const MAX_ADDRESS: u8 = 127;

/// Flash address range `[begin, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MemoryRange {
    /// First address.
    pub begin: u32,
    /// End address (exclusive).
    pub end: u32,
}

impl Default for MemoryRange {
    fn default() -> Self {
        Self {
            begin: MEMORY_START,
            end: MEMORY_END,
        }
    }
}

impl MemoryRange {
    /// Build a range from user input.
    ///
    /// An `end` below [`FLASH_BASE`] is a length relative to `begin`.
    pub fn resolve(begin: u32, end: u32) -> Result<Self> {
        let end = if end < FLASH_BASE {
            begin.checked_add(end).ok_or_else(|| {
                Error::InvalidRange(format!(
                    "length {end:#x} from {begin:#010x} overflows the address space"
                ))
            })?
        } else {
            end
        };

        if end <= begin {
            return Err(Error::InvalidRange(format!(
                "end {end:#010x} is not above begin {begin:#010x}"
            )));
        }

        Ok(Self { begin, end })
    }

    /// Number of bytes covered.
    pub fn len(&self) -> u32 {
        self.end - self.begin
    }

    /// Whether the range covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.end <= self.begin
    }

    /// Chunk start addresses in increasing order.
    ///
    /// A trailing partial chunk still yields its start address.
    pub fn chunk_addresses(&self) -> impl Iterator<Item = u32> + use<> {
        let end = self.end;
        (self.begin..end).step_by(CHUNK_SIZE)
    }

    /// Number of chunk transfers needed to cover the range.
    pub fn chunk_count(&self) -> usize {
        (self.len() as usize).div_ceil(CHUNK_SIZE)
    }
}

/// Everything one bootloader session needs to know.
#[derive(Debug, Clone)]
pub struct BootConfig {
    /// Slave address of the target (1..=127).
    pub address: u8,
    /// Flash range operated on.
    pub range: MemoryRange,
    /// Response timeout per request.
    pub timeout: Duration,
    /// Serial baud rate.
    pub baud_rate: u32,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            address: 1,
            range: MemoryRange::default(),
            timeout: DEFAULT_TIMEOUT,
            baud_rate: DEFAULT_BAUD,
        }
    }
}

impl BootConfig {
    /// Create a configuration for the given slave address.
    pub fn new(address: u8) -> Result<Self> {
        validate_address(address)?;
        Ok(Self {
            address,
            ..Default::default()
        })
    }

    /// Set the memory range.
    #[must_use]
    pub fn with_range(mut self, range: MemoryRange) -> Self {
        self.range = range;
        self
    }

    /// Set the response timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the baud rate.
    #[must_use]
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }
}

/// Check that a slave address is in 1..=127.
pub fn validate_address(address: u8) -> Result<()> {
    if (1..=MAX_ADDRESS).contains(&address) {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "device address {address} not in 1..{MAX_ADDRESS}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_range() {
        let range = MemoryRange::default();
        assert_eq!(range.begin, 0x0800_1000);
        assert_eq!(range.end, 0x0802_0000);
    }

    #[test]
    fn test_resolve_absolute_end() {
        let range = MemoryRange::resolve(0x0800_1000, 0x0800_1100).unwrap();
        assert_eq!(range.len(), 0x100);
        assert_eq!(range.chunk_count(), 2);
    }

    #[test]
    fn test_resolve_end_as_length() {
        let range = MemoryRange::resolve(0x0800_1000, 0x400).unwrap();
        assert_eq!(range.end, 0x0800_1400);
    }

    #[test]
    fn test_resolve_rejects_empty() {
        assert!(matches!(
            MemoryRange::resolve(0x0800_2000, 0x0800_1000),
            Err(Error::InvalidRange(_))
        ));
        assert!(MemoryRange::resolve(0x0800_1000, 0).is_err());
    }

    #[test]
    fn test_resolve_rejects_overflow() {
        assert!(MemoryRange::resolve(u32::MAX - 10, 0x100).is_err());
    }

    #[test]
    fn test_chunk_addresses() {
        let range = MemoryRange::resolve(0x0800_1000, 0x0800_1100).unwrap();
        let addrs: Vec<u32> = range.chunk_addresses().collect();
        assert_eq!(addrs, vec![0x0800_1000, 0x0800_1080]);
    }

    #[test]
    fn test_partial_trailing_chunk() {
        let range = MemoryRange::resolve(0x0800_1000, 0x0800_1081).unwrap();
        assert_eq!(range.chunk_addresses().count(), 2);
        assert_eq!(range.chunk_count(), 2);
    }

    #[test]
    fn test_address_bounds() {
        assert!(validate_address(0).is_err());
        assert!(validate_address(1).is_ok());
        assert!(validate_address(127).is_ok());
        assert!(validate_address(128).is_err());
        assert!(BootConfig::new(200).is_err());
    }

    #[test]
    fn test_config_builder() {
        let config = BootConfig::new(5)
            .unwrap()
            .with_timeout(Duration::from_millis(500))
            .with_baud_rate(57600);
        assert_eq!(config.address, 5);
        assert_eq!(config.timeout, Duration::from_millis(500));
        assert_eq!(config.baud_rate, 57600);
        assert_eq!(config.range, MemoryRange::default());
    }
}
