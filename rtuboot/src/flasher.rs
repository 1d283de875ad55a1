//! Bootloader transfer engine.
//!
//! [`Flasher`] drives the enter/exit handshake and the chunked bulk
//! operations over any [`Transport`]. Every bulk operation brackets its
//! transfers with `enter_boot` / `exit_boot`:
//!
//! ```text
//!   OUTSIDE ──enter_boot──▶ INSIDE ──exit_boot──▶ OUTSIDE
//!              (4 tries)      │        (4 tries)
//!                             ├─ read:    READ_CHUNK per chunk, no retry
//!                             ├─ verify:  READ_CHUNK + compare, stop at 16 mismatches
//!                             └─ program: WRITE_CHUNK per chunk, 5 tries each
//! ```
//!
//! After a program run with failed chunks the exit handshake is skipped so
//! the device stays in the bootloader instead of starting a damaged image.
//!
//! ## Example
//!
//! ```rust,no_run
//! # #[cfg(feature = "native")]
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use rtuboot::{BootConfig, FirmwareImage, Flasher, NativePort, Session};
//!
//! let config = BootConfig::new(1)?;
//! let port = NativePort::open_simple("/dev/ttyUSB0", config.baud_rate)?;
//! let mut flasher = Flasher::from_config(Session::from_config(port, &config)?, &config);
//!
//! let image = FirmwareImage::from_file("app.bin")?;
//! let begin = flasher.range().begin;
//! flasher
//!     .program(&image, begin, |done, total| {
//!         println!("{done}/{total}");
//!     })?
//!     .into_result()?;
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "native"))]
//! # fn main() {}
//! ```

use crate::config::{
    BootConfig, CHUNK_SIZE, MAGIC, MAX_HANDSHAKE_ATTEMPTS, MAX_VERIFY_MISMATCHES, MAX_WRITE_ATTEMPTS,
    MemoryRange,
};
use crate::error::{Error, Result};
use crate::image::FirmwareImage;
use crate::protocol::{BootEnter, BootExit, ReadChunk, WriteChunk, WriteStatus};
use crate::session::Transport;
use log::{debug, error, info, warn};
use std::fmt;
use std::io::Write;

/// A chunk whose write attempts were all exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkWriteError {
    /// Flash address of the chunk.
    pub address: u32,
    /// Last status word returned by the device, `None` if the last attempt
    /// got no valid response at all.
    pub status: Option<WriteStatus>,
}

impl fmt::Display for ChunkWriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "chunk {:#010x}: {status}", self.address),
            None => write!(f, "chunk {:#010x}: no valid response", self.address),
        }
    }
}

/// One byte that differs between the device and the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyMismatch {
    /// Absolute flash address.
    pub address: u32,
    /// Offset into the image file.
    pub file_offset: usize,
    /// Whether `file_offset` lies in the zero padding after the end of the file.
    pub padding: bool,
    /// Byte in the image.
    pub expected: u8,
    /// Byte read from the device.
    pub actual: u8,
}

impl fmt::Display for VerifyMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let place = if self.padding { "padding offset" } else { "file offset" };
        write!(
            f,
            "{:#010x} ({place} {:#x}): expected {:#04x}, read {:#04x}",
            self.address, self.file_offset, self.expected, self.actual
        )
    }
}

/// Outcome of [`Flasher::program`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramReport {
    /// Chunks acknowledged by the device.
    pub chunks_written: usize,
    /// Chunks that exhausted their retries, in address order.
    pub failed: Vec<ChunkWriteError>,
}

impl ProgramReport {
    /// Whether every chunk was written.
    pub fn is_ok(&self) -> bool {
        self.failed.is_empty()
    }

    /// Turn a report with failed chunks into [`Error::ProgramFailed`].
    pub fn into_result(self) -> Result<Self> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(Error::ProgramFailed {
                failed_chunks: self.failed.len(),
            })
        }
    }
}

/// Outcome of [`Flasher::verify`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Bytes read back and compared.
    pub bytes_compared: usize,
    /// Recorded differences, in address order.
    pub mismatches: Vec<VerifyMismatch>,
    /// Whether verify stopped early at the mismatch limit.
    pub truncated: bool,
}

impl VerifyReport {
    /// Whether the device matched the image.
    pub fn is_ok(&self) -> bool {
        self.mismatches.is_empty()
    }

    /// Turn a report with mismatches into [`Error::VerifyFailed`].
    pub fn into_result(self) -> Result<Self> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(Error::VerifyFailed {
                mismatches: self.mismatches.len(),
            })
        }
    }
}

/// Bootloader client bound to one transport.
pub struct Flasher<T: Transport> {
    transport: T,
    range: MemoryRange,
}

impl<T: Transport> Flasher<T> {
    /// Create a flasher over an open transport, using the default range.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            range: MemoryRange::default(),
        }
    }

    /// Create a flasher that works on the range of `config`.
    pub fn from_config(transport: T, config: &BootConfig) -> Self {
        if transport.address() != config.address {
            warn!(
                "Transport talks to slave {}, config names slave {}",
                transport.address(),
                config.address
            );
        }
        Self {
            transport,
            range: config.range,
        }
    }

    /// Configured flash range. Images are placed at its `begin`.
    pub fn range(&self) -> MemoryRange {
        self.range
    }

    /// Get a reference to the underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Get a mutable reference to the underlying transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Consume the flasher and return the underlying transport.
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Close the transport.
    pub fn close(mut self) -> Result<()> {
        self.transport.close()
    }

    /// Switch the device into bootloader mode. Returns the echoed magic.
    pub fn enter_boot(&mut self) -> Result<u32> {
        let request = BootEnter { magic: MAGIC };

        for attempt in 1..=MAX_HANDSHAKE_ATTEMPTS {
            debug!("BOOT_ENTER attempt {attempt}/{MAX_HANDSHAKE_ATTEMPTS}");
            match self.transport.execute(&request) {
                Ok(magic) => {
                    info!("Entered bootloader on slave {}", self.transport.address());
                    return Ok(magic);
                },
                Err(e) if e.is_recoverable() => {
                    warn!("Boot entry failed (attempt {attempt}/{MAX_HANDSHAKE_ATTEMPTS}): {e}");
                },
                Err(e) => return Err(e),
            }
        }

        Err(Error::BootEntryFailed {
            attempts: MAX_HANDSHAKE_ATTEMPTS,
        })
    }

    /// Leave bootloader mode and start the application.
    pub fn exit_boot(&mut self) -> Result<()> {
        for attempt in 1..=MAX_HANDSHAKE_ATTEMPTS {
            debug!("BOOT_EXIT attempt {attempt}/{MAX_HANDSHAKE_ATTEMPTS}");
            match self.transport.execute(&BootExit) {
                Ok(()) => {
                    info!("Left bootloader");
                    return Ok(());
                },
                Err(e) if e.is_recoverable() => {
                    warn!("Boot exit failed (attempt {attempt}/{MAX_HANDSHAKE_ATTEMPTS}): {e}");
                },
                Err(e) => return Err(e),
            }
        }

        Err(Error::BootExitFailed {
            attempts: MAX_HANDSHAKE_ATTEMPTS,
        })
    }

    /// Run the exit handshake after an operation.
    ///
    /// An exit failure only replaces a successful outcome; after a failed
    /// operation it is logged and the original error is kept.
    fn finish<R>(&mut self, outcome: Result<R>) -> Result<R> {
        match outcome {
            Ok(value) => {
                self.exit_boot()?;
                Ok(value)
            },
            Err(e) => {
                if let Err(exit_err) = self.exit_boot() {
                    warn!("Cleanup exit failed: {exit_err}");
                }
                Err(e)
            },
        }
    }

    /// Enter and leave the bootloader. Returns the echoed magic.
    pub fn test(&mut self) -> Result<u32> {
        let magic = self.enter_boot()?;
        info!("return magic: {magic:#010x}");
        self.exit_boot()?;
        Ok(magic)
    }

    /// Dump `range` to `out` in address order. Returns the bytes written.
    ///
    /// A trailing partial chunk is written whole. The first failed chunk
    /// aborts the read.
    pub fn read<W, F>(&mut self, range: MemoryRange, out: &mut W, progress: F) -> Result<usize>
    where
        W: Write,
        F: FnMut(usize, usize),
    {
        self.enter_boot()?;
        info!(
            "Reading {:#010x}..{:#010x} ({} chunks)",
            range.begin,
            range.end,
            range.chunk_count()
        );
        let outcome = self.read_chunks(range, out, progress);
        self.finish(outcome)
    }

    fn read_chunks<W, F>(&mut self, range: MemoryRange, out: &mut W, mut progress: F) -> Result<usize>
    where
        W: Write,
        F: FnMut(usize, usize),
    {
        let total = range.chunk_count() * CHUNK_SIZE;
        let mut written = 0;

        for address in range.chunk_addresses() {
            let chunk = self.transport.execute(&ReadChunk { address })?;
            out.write_all(&chunk.data)?;
            written += CHUNK_SIZE;
            progress(written, total);
        }

        out.flush()?;
        info!("Read {written} bytes");
        Ok(written)
    }

    /// Compare flash starting at `begin` against `image`.
    ///
    /// Transfer errors abort the verify. Differences are returned in the
    /// report; use [`VerifyReport::into_result`] to treat them as an error.
    pub fn verify<F>(&mut self, image: &FirmwareImage, begin: u32, progress: F) -> Result<VerifyReport>
    where
        F: FnMut(usize, usize),
    {
        check_fits(image, begin)?;
        self.enter_boot()?;
        info!("Verifying {} bytes at {begin:#010x}", image.len());
        let outcome = self.verify_chunks(image, begin, progress);
        self.finish(outcome)
    }

    fn verify_chunks<F>(&mut self, image: &FirmwareImage, begin: u32, mut progress: F) -> Result<VerifyReport>
    where
        F: FnMut(usize, usize),
    {
        let total = image.len();
        let mut report = VerifyReport::default();

        'chunks: for (offset, expected) in image.chunks() {
            let address = chunk_address(begin, offset);
            let chunk = self.transport.execute(&ReadChunk { address })?;

            for (i, (&want, &got)) in expected.iter().zip(chunk.data.iter()).enumerate() {
                if want == got {
                    continue;
                }
                let mismatch = VerifyMismatch {
                    address: chunk_address(address, i),
                    file_offset: offset + i,
                    padding: offset + i >= image.file_len(),
                    expected: want,
                    actual: got,
                };
                error!("Mismatch at {mismatch}");
                report.mismatches.push(mismatch);

                if report.mismatches.len() >= MAX_VERIFY_MISMATCHES {
                    report.bytes_compared = offset + i + 1;
                    report.truncated = true;
                    warn!("Stopping after {MAX_VERIFY_MISMATCHES} mismatches");
                    break 'chunks;
                }
            }

            report.bytes_compared = offset + CHUNK_SIZE;
            progress(report.bytes_compared, total);
        }

        if report.is_ok() {
            info!("Verify OK ({} bytes)", report.bytes_compared);
        } else {
            error!("Verify BAD ({} mismatches)", report.mismatches.len());
        }
        Ok(report)
    }

    /// Write `image` to flash starting at `begin`.
    ///
    /// The image is sanity-checked before anything is sent. Each chunk gets
    /// up to 5 attempts; failed chunks are recorded and the remaining chunks
    /// are still written. If any chunk failed the device is left in the
    /// bootloader.
    pub fn program<F>(&mut self, image: &FirmwareImage, begin: u32, progress: F) -> Result<ProgramReport>
    where
        F: FnMut(usize, usize),
    {
        image.validate()?;
        check_fits(image, begin)?;

        self.enter_boot()?;
        info!("Programming {} bytes at {begin:#010x}", image.len());

        match self.write_chunks(image, begin, progress) {
            Ok(report) if report.is_ok() => {
                info!("Program OK ({} chunks)", report.chunks_written);
                self.exit_boot()?;
                Ok(report)
            },
            Ok(report) => {
                error!(
                    "Program BAD ({} of {} chunks failed), staying in bootloader",
                    report.failed.len(),
                    image.chunk_count()
                );
                Ok(report)
            },
            Err(e) => self.finish(Err(e)),
        }
    }

    fn write_chunks<F>(&mut self, image: &FirmwareImage, begin: u32, mut progress: F) -> Result<ProgramReport>
    where
        F: FnMut(usize, usize),
    {
        let total = image.len();
        let mut report = ProgramReport::default();

        for (offset, data) in image.chunks() {
            let request = WriteChunk::new(chunk_address(begin, offset), data);
            match self.write_chunk(&request)? {
                None => report.chunks_written += 1,
                Some(failure) => {
                    error!("Write failed at {failure}");
                    report.failed.push(failure);
                },
            }
            progress(offset + CHUNK_SIZE, total);
        }

        Ok(report)
    }

    /// Write one chunk with retries. `Ok(None)` means the chunk was accepted.
    fn write_chunk(&mut self, request: &WriteChunk) -> Result<Option<ChunkWriteError>> {
        let address = request.address;
        let mut last_status = None;

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            debug!("WRITE_CHUNK {address:#010x} attempt {attempt}/{MAX_WRITE_ATTEMPTS}");
            match self.transport.execute(request) {
                Ok(status) if status.is_ok() => return Ok(None),
                Ok(status) => {
                    warn!("Write {address:#010x} rejected (attempt {attempt}/{MAX_WRITE_ATTEMPTS}): {status}");
                    last_status = Some(status);
                },
                Err(e) if e.is_recoverable() => {
                    warn!("Write {address:#010x} failed (attempt {attempt}/{MAX_WRITE_ATTEMPTS}): {e}");
                    last_status = None;
                },
                Err(e) => return Err(e),
            }
        }

        Ok(Some(ChunkWriteError {
            address,
            status: last_status,
        }))
    }
}

#[allow(clippy::cast_possible_truncation)]
fn chunk_address(base: u32, offset: usize) -> u32 {
    // check_fits guarantees the sum stays in range
    base.wrapping_add(offset as u32)
}

/// Reject images that would run past the end of the address space.
fn check_fits(image: &FirmwareImage, begin: u32) -> Result<()> {
    let fits = u32::try_from(image.len())
        .ok()
        .and_then(|len| begin.checked_add(len))
        .is_some();
    if fits {
        Ok(())
    } else {
        Err(Error::InvalidRange(format!(
            "{} byte image does not fit at {begin:#010x}",
            image.len()
        )))
    }
}
