//! CRC-16/MODBUS checksum.
//!
//! Reflected polynomial 0xA001 (0x8005), initial value 0xFFFF, no final XOR.
//! Appending the checksum little-endian makes the CRC of the whole buffer
//! evaluate to zero, which is how received frames are validated.

/// Reflected CRC-16/MODBUS polynomial.
const POLY: u16 = 0xA001;

/// Initial register value.
const INIT: u16 = 0xFFFF;

/// Compute the CRC-16/MODBUS checksum of `data`.
pub fn crc16_modbus(data: &[u8]) -> u16 {
    data.iter().fold(INIT, |crc, &byte| {
        let mut crc = crc ^ u16::from(byte);
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ POLY
            } else {
                crc >> 1
            };
        }
        crc
    })
}
