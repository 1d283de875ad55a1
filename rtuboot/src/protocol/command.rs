//! Bootloader command set.
//!
//! Each command is a plain value type implementing [`Command`]: it knows its
//! opcode, the exact payload sizes in both directions, how to encode its
//! request payload, and how to decode (and validate) the response payload.
//!
//! | Command      | Opcode | Request payload          | Response payload          |
//! |--------------|--------|--------------------------|---------------------------|
//! | `BootEnter`  | 100    | magic (u32)              | magic echo (u32)          |
//! | `ReadChunk`  | 101    | address (u32)            | address (u32) + 128 bytes |
//! | `BootExit`   | 102    | -                        | -                         |
//! | `WriteChunk` | 103    | address (u32) + 128 bytes| address (u32) + status    |
//!
//! All integers are little-endian.

use crate::config::{CHUNK_SIZE, MAGIC};
use crate::error::{Error, FrameError, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

/// Bootloader opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Enter bootloader mode.
    BootEnter = 100,
    /// Read one chunk of flash.
    ReadChunk = 101,
    /// Leave bootloader mode and start the application.
    BootExit = 102,
    /// Write one chunk of flash.
    WriteChunk = 103,
}

impl Opcode {
    /// Raw opcode byte.
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BootEnter => "BOOT_ENTER",
            Self::ReadChunk => "READ_CHUNK",
            Self::BootExit => "BOOT_EXIT",
            Self::WriteChunk => "WRITE_CHUNK",
        };
        write!(f, "{name}({})", self.code())
    }
}

/// A request/response pair understood by the bootloader.
pub trait Command {
    /// Opcode carried in both request and response frames.
    const OPCODE: Opcode;
    /// Request payload length in bytes.
    const REQUEST_LEN: usize;
    /// Response payload length in bytes.
    const RESPONSE_LEN: usize;

    /// Decoded response.
    type Response;

    /// Encode the request payload (exactly `REQUEST_LEN` bytes).
    fn encode(&self) -> Vec<u8>;

    /// Decode a response payload and check it against this request.
    fn decode_response(&self, payload: &[u8]) -> Result<Self::Response>;
}

fn check_len(payload: &[u8], expected: usize) -> Result<()> {
    if payload.len() < expected {
        return Err(FrameError::TooShort { len: payload.len() }.into());
    }
    Ok(())
}

fn check_echo(field: &'static str, expected: u32, actual: u32) -> Result<()> {
    if expected != actual {
        return Err(Error::EchoMismatch {
            field,
            expected,
            actual,
        });
    }
    Ok(())
}

/// Enter-bootloader request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootEnter {
    /// Magic word the device must echo.
    pub magic: u32,
}

impl Default for BootEnter {
    fn default() -> Self {
        Self { magic: MAGIC }
    }
}

impl Command for BootEnter {
    const OPCODE: Opcode = Opcode::BootEnter;
    const REQUEST_LEN: usize = 4;
    const RESPONSE_LEN: usize = 4;

    /// The echoed magic.
    type Response = u32;

    fn encode(&self) -> Vec<u8> {
        self.magic.to_le_bytes().to_vec()
    }

    fn decode_response(&self, payload: &[u8]) -> Result<u32> {
        check_len(payload, Self::RESPONSE_LEN)?;
        let magic = LittleEndian::read_u32(&payload[..4]);
        check_echo("magic", self.magic, magic)?;
        Ok(magic)
    }
}

/// Exit-bootloader request. A well-framed empty response means success.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootExit;

impl Command for BootExit {
    const OPCODE: Opcode = Opcode::BootExit;
    const REQUEST_LEN: usize = 0;
    const RESPONSE_LEN: usize = 0;

    type Response = ();

    fn encode(&self) -> Vec<u8> {
        Vec::new()
    }

    fn decode_response(&self, _payload: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Read one chunk of flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadChunk {
    /// Flash address of the chunk.
    pub address: u32,
}

/// Chunk contents returned by [`ReadChunk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkData {
    /// Echoed flash address.
    pub address: u32,
    /// Flash contents.
    pub data: [u8; CHUNK_SIZE],
}

impl Command for ReadChunk {
    const OPCODE: Opcode = Opcode::ReadChunk;
    const REQUEST_LEN: usize = 4;
    const RESPONSE_LEN: usize = 4 + CHUNK_SIZE;

    type Response = ChunkData;

    fn encode(&self) -> Vec<u8> {
        self.address.to_le_bytes().to_vec()
    }

    fn decode_response(&self, payload: &[u8]) -> Result<ChunkData> {
        check_len(payload, Self::RESPONSE_LEN)?;
        let address = LittleEndian::read_u32(&payload[..4]);
        check_echo("address", self.address, address)?;

        let mut data = [0u8; CHUNK_SIZE];
        data.copy_from_slice(&payload[4..Self::RESPONSE_LEN]);
        Ok(ChunkData { address, data })
    }
}

/// Status word returned by [`WriteChunk`].
///
/// Only two values are known to mean success; every other value is an
/// opaque device error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// One of the success sentinels.
    Ok(u32),
    /// Any other status word.
    Failed(u32),
}

impl WriteStatus {
    /// Status words the bootloader uses to acknowledge a written chunk.
    pub const SUCCESS: [u32; 2] = [0x0000_0000, MAGIC];

    /// Classify a raw status word.
    pub fn from_word(word: u32) -> Self {
        if Self::SUCCESS.contains(&word) {
            Self::Ok(word)
        } else {
            Self::Failed(word)
        }
    }

    /// Whether the chunk was accepted.
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Ok(_))
    }

    /// Raw status word.
    pub fn word(self) -> u32 {
        match self {
            Self::Ok(w) | Self::Failed(w) => w,
        }
    }
}

impl fmt::Display for WriteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok(w) => write!(f, "ok ({w:#010x})"),
            Self::Failed(w) => write!(f, "error code {w:#010x}"),
        }
    }
}

/// Write one chunk of flash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteChunk {
    /// Flash address of the chunk.
    pub address: u32,
    /// Data to program.
    pub data: [u8; CHUNK_SIZE],
}

impl WriteChunk {
    /// Build a write request; short data is zero-padded.
    pub fn new(address: u32, data: &[u8]) -> Self {
        let mut chunk = [0u8; CHUNK_SIZE];
        let n = data.len().min(CHUNK_SIZE);
        chunk[..n].copy_from_slice(&data[..n]);
        Self {
            address,
            data: chunk,
        }
    }
}

impl Command for WriteChunk {
    const OPCODE: Opcode = Opcode::WriteChunk;
    const REQUEST_LEN: usize = 4 + CHUNK_SIZE;
    const RESPONSE_LEN: usize = 8;

    type Response = WriteStatus;

    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::REQUEST_LEN];
        LittleEndian::write_u32(&mut buf[..4], self.address);
        buf[4..].copy_from_slice(&self.data);
        buf
    }

    fn decode_response(&self, payload: &[u8]) -> Result<WriteStatus> {
        check_len(payload, Self::RESPONSE_LEN)?;
        let address = LittleEndian::read_u32(&payload[..4]);
        check_echo("address", self.address, address)?;
        Ok(WriteStatus::from_word(LittleEndian::read_u32(&payload[4..8])))
    }
}
