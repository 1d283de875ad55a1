//! Test, read, verify and program command implementations.

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use rtuboot::{FirmwareImage, Flasher, Transport};
use std::io::{BufWriter, IntoInnerError};
use std::path::Path;
use tempfile::NamedTempFile;

use crate::Settings;
use crate::serial::{Link, open_link};
use crate::use_fancy_output;

fn progress_bar(quiet: bool, message: &str) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(100);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb.set_message(message.to_string());
    pb
}

/// Percentage for the progress bar.
fn percent(done: usize, total: usize) -> u64 {
    if total == 0 {
        return 100;
    }
    (done.min(total) * 100 / total) as u64
}

/// Open the link, run `op` and close the link whatever the outcome.
fn with_flasher<R>(
    settings: &Settings,
    op: impl FnOnce(&mut Flasher<Link>) -> rtuboot::Result<R>,
) -> Result<R> {
    let mut flasher = Flasher::from_config(open_link(settings)?, &settings.boot);
    let outcome = op(&mut flasher);
    if let Err(e) = flasher.transport_mut().close() {
        debug!("Closing port failed: {e}");
    }
    Ok(outcome?)
}

/// Test mode: enter and leave the bootloader.
pub(crate) fn cmd_test(settings: &Settings) -> Result<()> {
    let magic = with_flasher(settings, Flasher::test)?;
    if !settings.quiet {
        eprintln!(
            "{} Bootloader on slave {} answered (magic {magic:#010x})",
            style("✓").green(),
            settings.boot.address
        );
    }
    Ok(())
}

/// Read mode: dump the configured range to `path`.
///
/// Data goes to a staging file next to `path`, which only replaces `path`
/// once the whole range was read.
pub(crate) fn cmd_read(settings: &Settings, path: &Path) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let staging = NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create a file in {}", dir.display()))?;
    let mut out = BufWriter::new(staging);

    let pb = progress_bar(settings.quiet, "Reading");
    let read = with_flasher(settings, |flasher| {
        let range = flasher.range();
        let written =
            flasher.read(range, &mut out, |done, total| pb.set_position(percent(done, total)))?;
        Ok((written, range))
    });
    pb.finish_and_clear();
    let (written, range) = read.with_context(|| format!("reading into {} failed", path.display()))?;

    let staging = out.into_inner().map_err(IntoInnerError::into_error)?;
    staging
        .persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("failed to write {}", path.display()))?;

    if !settings.quiet {
        eprintln!("{} write: {}", style("→").cyan(), path.display());
        eprintln!(
            "{} close: {} ({written} bytes from {:#010x})",
            style("✓").green(),
            path.display(),
            range.begin
        );
    }
    Ok(())
}

/// Verify mode: compare flash against the image at `path`.
pub(crate) fn cmd_verify(settings: &Settings, path: &Path) -> Result<()> {
    let image = FirmwareImage::from_file(path)
        .with_context(|| format!("failed to load image {}", path.display()))?;
    let begin = settings.boot.range.begin;

    let pb = progress_bar(settings.quiet, "Verifying");
    let report = with_flasher(settings, |flasher| {
        let begin = flasher.range().begin;
        flasher.verify(&image, begin, |done, total| pb.set_position(percent(done, total)))
    });
    pb.finish_and_clear();
    let report = report?;

    if !report.is_ok() && !settings.quiet {
        for mismatch in &report.mismatches {
            eprintln!("  {} {mismatch}", style("✗").red());
        }
        if report.truncated {
            eprintln!(
                "  {}",
                style(format!(
                    "stopped after {} mismatches",
                    report.mismatches.len()
                ))
                .dim()
            );
        }
    }

    let report = report.into_result()?;
    if !settings.quiet {
        eprintln!(
            "{} Verify OK: {} bytes at {begin:#010x} match {}",
            style("✓").green(),
            report.bytes_compared,
            path.display()
        );
    }
    Ok(())
}

/// Program mode: write the image at `path`.
pub(crate) fn cmd_program(settings: &Settings, path: &Path) -> Result<()> {
    let image = FirmwareImage::from_file(path)
        .with_context(|| format!("failed to load image {}", path.display()))?;
    let begin = settings.boot.range.begin;

    if !settings.quiet {
        eprintln!(
            "{} {} ({} bytes, {} chunks) -> {begin:#010x}",
            style("→").cyan(),
            path.display(),
            image.file_len(),
            image.chunk_count()
        );
    }

    let pb = progress_bar(settings.quiet, "Programming");
    let report = with_flasher(settings, |flasher| {
        let begin = flasher.range().begin;
        flasher.program(&image, begin, |done, total| pb.set_position(percent(done, total)))
    });
    pb.finish_and_clear();
    let report = report?;

    if !report.is_ok() && !settings.quiet {
        for failure in &report.failed {
            eprintln!("  {} {failure}", style("✗").red());
        }
    }

    let report = report.into_result()?;
    if !settings.quiet {
        eprintln!(
            "{} Program OK: {} chunks written",
            style("✓").green(),
            report.chunks_written
        );
    }
    Ok(())
}
