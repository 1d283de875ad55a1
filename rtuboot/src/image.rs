//! Raw binary firmware images.
//!
//! Images carry no container format: the file is the flash contents,
//! starting with the Cortex-M vector table.
//!
//! ```text
//! offset 0   initial stack pointer (u32 LE)   must point into RAM
//! offset 4   reset vector          (u32 LE)   must point into flash
//! offset 8   remaining vectors and code ...
//! ```
//!
//! The buffer is zero-padded to a multiple of [`CHUNK_SIZE`] on load so
//! every chunk can be sent or compared whole.

use crate::config::{CHUNK_SIZE, FLASH_BASE, RAM_BASE};
use crate::error::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use std::fs;
use std::path::Path;

/// Size of the part of the vector table checked before programming.
pub const VECTOR_TABLE_LEN: usize = 8;

/// Firmware image, padded to whole chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Vec<u8>,
    file_len: usize,
}

impl FirmwareImage {
    /// Load an image from a raw binary file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path)?;
        debug!("Loaded {} ({} bytes)", path.display(), data.len());
        Ok(Self::from_bytes(data))
    }

    /// Wrap raw image bytes, zero-padding to a multiple of the chunk size.
    pub fn from_bytes(mut data: Vec<u8>) -> Self {
        let file_len = data.len();
        data.resize(file_len.div_ceil(CHUNK_SIZE) * CHUNK_SIZE, 0);
        Self { data, file_len }
    }

    /// Padded length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the image holds no data at all.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Length of the original file before padding.
    pub fn file_len(&self) -> usize {
        self.file_len
    }

    /// Padded image bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Number of chunks in the padded image.
    pub fn chunk_count(&self) -> usize {
        self.data.len() / CHUNK_SIZE
    }

    /// `(file offset, chunk)` pairs in increasing offset order.
    pub fn chunks(&self) -> impl Iterator<Item = (usize, &[u8])> {
        self.data
            .chunks_exact(CHUNK_SIZE)
            .enumerate()
            .map(|(i, chunk)| (i * CHUNK_SIZE, chunk))
    }

    /// Initial stack pointer and reset vector, if the file is long enough.
    pub fn vector_table(&self) -> Option<(u32, u32)> {
        if self.file_len < VECTOR_TABLE_LEN {
            return None;
        }
        Some((
            LittleEndian::read_u32(&self.data[0..4]),
            LittleEndian::read_u32(&self.data[4..8]),
        ))
    }

    /// Check that the image looks like an application for this target.
    ///
    /// The stack pointer must lie in the 64 KiB RAM window at [`RAM_BASE`] and
    /// the reset vector in the 1 MiB flash window at [`FLASH_BASE`].
    pub fn validate(&self) -> Result<()> {
        let (sp, entry) = self.vector_table().ok_or_else(|| {
            Error::ImageRejected(format!(
                "image is {} bytes, too short for a vector table",
                self.file_len
            ))
        })?;

        if sp >> 16 != RAM_BASE >> 16 {
            return Err(Error::ImageRejected(format!(
                "initial stack pointer {sp:#010x} is outside RAM"
            )));
        }
        if entry >> 20 != FLASH_BASE >> 20 {
            return Err(Error::ImageRejected(format!(
                "reset vector {entry:#010x} is outside flash"
            )));
        }

        debug!("Vector table ok: sp={sp:#010x} entry={entry:#010x}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn image_with_vectors(sp: u32, entry: u32, extra: usize) -> FirmwareImage {
        let mut data = Vec::new();
        data.extend(sp.to_le_bytes());
        data.extend(entry.to_le_bytes());
        data.resize(VECTOR_TABLE_LEN + extra, 0xA5);
        FirmwareImage::from_bytes(data)
    }

    #[test]
    fn test_padding() {
        let image = FirmwareImage::from_bytes(vec![1; 130]);
        assert_eq!(image.len(), 256);
        assert_eq!(image.file_len(), 130);
        assert_eq!(image.chunk_count(), 2);
        assert!(image.as_bytes()[130..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_exact_multiple_not_padded() {
        let image = FirmwareImage::from_bytes(vec![1; 256]);
        assert_eq!(image.len(), 256);
    }

    #[test]
    fn test_empty_image() {
        let image = FirmwareImage::from_bytes(Vec::new());
        assert!(image.is_empty());
        assert_eq!(image.chunks().count(), 0);
    }

    #[test]
    fn test_chunk_offsets() {
        let image = FirmwareImage::from_bytes(vec![0; 300]);
        let offsets: Vec<usize> = image.chunks().map(|(off, _)| off).collect();
        assert_eq!(offsets, vec![0, 128, 256]);
        assert!(image.chunks().all(|(_, c)| c.len() == CHUNK_SIZE));
    }

    #[test]
    fn test_valid_vector_table() {
        let image = image_with_vectors(0x2000_1000, 0x0800_1000, 504);
        assert_eq!(image.vector_table(), Some((0x2000_1000, 0x0800_1000)));
        image.validate().unwrap();
    }

    #[test]
    fn test_rejects_stack_outside_ram() {
        let image = image_with_vectors(0x1000_0000, 0x0800_1000, 0);
        let err = image.validate().unwrap_err();
        assert!(matches!(err, Error::ImageRejected(ref msg) if msg.contains("stack")));
    }

    #[test]
    fn test_rejects_entry_outside_flash() {
        let image = image_with_vectors(0x2000_1000, 0x0810_0000, 0);
        assert!(matches!(image.validate(), Err(Error::ImageRejected(_))));
    }

    #[test]
    fn test_rejects_short_image() {
        // Padding must not make a 4-byte file look like it has a vector table
        let image = FirmwareImage::from_bytes(0x2000_1000u32.to_le_bytes().to_vec());
        assert_eq!(image.vector_table(), None);
        assert!(matches!(image.validate(), Err(Error::ImageRejected(_))));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[7; 10]).unwrap();
        let image = FirmwareImage::from_file(file.path()).unwrap();
        assert_eq!(image.file_len(), 10);
        assert_eq!(image.len(), 128);
    }

    #[test]
    fn test_from_missing_file() {
        assert!(matches!(
            FirmwareImage::from_file("/nonexistent/rtuboot.bin"),
            Err(Error::Io(_))
        ));
    }
}
