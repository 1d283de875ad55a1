//! Modbus-RTU style frame codec.
//!
//! ## Frame Format
//!
//! ```text
//! +---------+---------+---------------+--------+
//! | Address | Command |    Payload    | CRC16  |
//! +---------+---------+---------------+--------+
//! | 1 byte  | 1 byte  |   N bytes     | 2 bytes|
//! +---------+---------+---------------+--------+
//! | 1..127  | opcode  | per command   | LE     |
//! +---------+---------+---------------+--------+
//! ```
//!
//! There is no length field: N is fixed per command, so the receiver knows
//! how many bytes to wait for.

use crate::error::FrameError;
use crate::protocol::crc::crc16_modbus;

/// Address + command bytes.
pub const HEADER_LEN: usize = 2;

/// Trailing CRC bytes.
pub const CRC_LEN: usize = 2;

/// Smallest possible frame (empty payload).
pub const MIN_FRAME_LEN: usize = HEADER_LEN + CRC_LEN;

/// Total frame length for a payload of `payload_len` bytes.
pub const fn frame_len(payload_len: usize) -> usize {
    HEADER_LEN + payload_len + CRC_LEN
}

/// Encode a frame.
pub fn encode(address: u8, command: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(frame_len(payload.len()));
    buf.push(address);
    buf.push(command);
    buf.extend_from_slice(payload);

    let crc = crc16_modbus(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

/// Decode a frame and return its payload.
///
/// Checks run in order: length, address, command, checksum.
pub fn decode(data: &[u8], expected_address: u8, expected_command: u8) -> Result<&[u8], FrameError> {
    if data.len() < MIN_FRAME_LEN {
        return Err(FrameError::TooShort { len: data.len() });
    }

    if data[0] != expected_address {
        return Err(FrameError::AddressMismatch {
            expected: expected_address,
            actual: data[0],
        });
    }

    if data[1] != expected_command {
        return Err(FrameError::CommandMismatch {
            expected: expected_command,
            actual: data[1],
        });
    }

    let residue = crc16_modbus(data);
    if residue != 0 {
        return Err(FrameError::ChecksumInvalid { residue });
    }

    Ok(&data[HEADER_LEN..data.len() - CRC_LEN])
}
