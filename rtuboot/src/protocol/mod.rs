//! Protocol implementations.

pub mod command;
pub mod crc;
pub mod frame;

// Re-export common types
pub use command::{BootEnter, BootExit, ChunkData, Command, Opcode, ReadChunk, WriteChunk, WriteStatus};
pub use crc::crc16_modbus;
