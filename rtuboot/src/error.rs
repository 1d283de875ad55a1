//! Error types for rtuboot.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for rtuboot operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Frame-level integrity failures reported by the frame codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Fewer bytes than address + command + CRC.
    #[error("frame too short ({len} bytes)")]
    TooShort {
        /// Number of bytes received.
        len: usize,
    },

    /// Response came from a different slave.
    #[error("address mismatch: expected {expected}, got {actual}")]
    AddressMismatch {
        /// Address the request was sent to.
        expected: u8,
        /// Address found in the response.
        actual: u8,
    },

    /// Response carries a different opcode.
    #[error("command mismatch: expected {expected}, got {actual}")]
    CommandMismatch {
        /// Opcode of the request.
        expected: u8,
        /// Opcode found in the response.
        actual: u8,
    },

    /// CRC over the whole frame did not evaluate to zero.
    #[error("checksum invalid (residue {residue:#06x})")]
    ChecksumInvalid {
        /// CRC register value over the received bytes.
        residue: u16,
    },
}

/// Error type for rtuboot operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// A response frame failed to decode.
    #[error("Protocol error: {0}")]
    Protocol(#[from] FrameError),

    /// A well-formed response echoed a value other than the one sent.
    #[error("Echo mismatch in {field}: expected {expected:#010x}, got {actual:#010x}")]
    EchoMismatch {
        /// Name of the echoed field.
        field: &'static str,
        /// Value sent in the request.
        expected: u32,
        /// Value echoed by the device.
        actual: u32,
    },

    /// No complete response arrived in time.
    #[error("Timeout: no response to command {opcode} within {}ms", waited.as_millis())]
    Timeout {
        /// Opcode of the unanswered request.
        opcode: u8,
        /// Time waited for the response.
        waited: Duration,
    },

    /// Device did not acknowledge the enter-bootloader handshake.
    #[error("Boot entry failed after {attempts} attempts")]
    BootEntryFailed {
        /// Number of attempts made.
        attempts: usize,
    },

    /// Device did not acknowledge the exit-bootloader handshake.
    #[error("Boot exit failed after {attempts} attempts")]
    BootExitFailed {
        /// Number of attempts made.
        attempts: usize,
    },

    /// Firmware image failed the sanity check; nothing was written.
    #[error("Image rejected: {0}")]
    ImageRejected(String),

    /// Verify found differences between the device and the image.
    #[error("Verify failed: {mismatches} mismatching bytes")]
    VerifyFailed {
        /// Number of mismatching bytes recorded.
        mismatches: usize,
    },

    /// One or more chunks could not be written.
    #[error("Program failed: {failed_chunks} chunks not written, device left in bootloader")]
    ProgramFailed {
        /// Number of chunks that exhausted their retries.
        failed_chunks: usize,
    },

    /// Invalid memory range.
    #[error("Invalid memory range: {0}")]
    InvalidRange(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether a retry loop may swallow this error and try again.
    ///
    /// Port failures are not recoverable: the link itself is gone.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Protocol(_) | Self::EchoMismatch { .. }
        )
    }
}
