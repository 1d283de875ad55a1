//! rtuboot CLI - Command-line client for Modbus-RTU framed serial bootloaders.
//!
//! ## Features
//!
//! - Test the bootloader handshake
//! - Dump flash to a binary file
//! - Verify flash against a firmware image
//! - Program a firmware image
//! - List serial ports
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use clap::{ArgGroup, Parser, ValueEnum};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use rtuboot::config::{DEFAULT_BAUD, DEFAULT_TIMEOUT};
use rtuboot::{BootConfig, MEMORY_END, MEMORY_START, MemoryRange, Parity};
use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

mod commands;
mod config;
mod serial;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Check if animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Errors that map to a specific exit code.
#[derive(Debug, Error)]
pub(crate) enum CliError {
    /// Invalid invocation: bad option value, missing port, etc.
    #[error("{0}")]
    Usage(String),
}

/// rtuboot - Talk to a Modbus-RTU framed bootloader over a serial line.
///
/// Environment variables:
///   RTUBOOT_PORT   - Default serial port
///   RTUBOOT_BAUD   - Default baud rate (default: 115200)
///   RTUBOOT_ADR    - Default device address (default: 1)
#[derive(Parser, Debug)]
#[command(name = "rtuboot")]
#[command(author, version, about, long_about = None)]
#[command(group(
    ArgGroup::new("mode")
        .required(true)
        .args(["test", "comports", "read", "verify", "prog", "completions"])
))]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Serial port to use (first port in name order if not specified).
    #[arg(env = "RTUBOOT_PORT")]
    port: Option<String>,

    /// Device address (1..127).
    #[arg(
        short,
        long = "adr",
        env = "RTUBOOT_ADR",
        value_parser = clap::value_parser!(u8).range(1..=127)
    )]
    adr: Option<u8>,

    /// First flash address (hex with 0x prefix or decimal).
    #[arg(short, long = "beginmemory", value_name = "ADDR", value_parser = parse_u32)]
    beginmemory: Option<u32>,

    /// End flash address; a value below the flash base is a length.
    #[arg(short, long = "endmemory", value_name = "ADDR", value_parser = parse_u32)]
    endmemory: Option<u32>,

    /// Enter and leave the bootloader.
    #[arg(short, long)]
    test: bool,

    /// List serial ports.
    #[arg(long)]
    comports: bool,

    /// Dump the memory range to FILE.
    #[arg(short, long, value_name = "FILE")]
    read: Option<PathBuf>,

    /// Compare flash with the image in FILE.
    #[arg(long, value_name = "FILE", value_parser = existing_file)]
    verify: Option<PathBuf>,

    /// Program the image in FILE.
    #[arg(short, long, value_name = "FILE", value_parser = existing_file)]
    prog: Option<PathBuf>,

    /// Print a shell completion script.
    #[arg(long, value_name = "SHELL", value_enum)]
    completions: Option<Shell>,

    /// Output the port list as JSON.
    #[arg(long, requires = "comports")]
    json: bool,

    /// Baud rate.
    #[arg(long, env = "RTUBOOT_BAUD")]
    baud: Option<u32>,

    /// Parity bit of the serial line.
    #[arg(long, value_enum)]
    parity: Option<LineParity>,

    /// Response timeout in milliseconds.
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// How responses are received.
    #[arg(long, value_enum)]
    transport: Option<TransportKind>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long)]
    quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", value_name = "PATH")]
    config_path: Option<PathBuf>,
}

/// Transport implementations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub(crate) enum TransportKind {
    /// Read responses on the calling thread.
    #[default]
    Blocking,
    /// Collect responses on a background thread.
    Listener,
}

/// Serial line parity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub(crate) enum LineParity {
    /// 8N1.
    #[default]
    None,
    /// 8E1.
    Even,
    /// 8O1.
    Odd,
}

impl From<LineParity> for Parity {
    fn from(parity: LineParity) -> Self {
        match parity {
            LineParity::None => Self::None,
            LineParity::Even => Self::Even,
            LineParity::Odd => Self::Odd,
        }
    }
}

/// Resolve an enum option: flag first, then the config file's spelling.
fn flag_or_config<T: ValueEnum + Default>(
    flag: Option<T>,
    config: Option<&str>,
    key: &str,
) -> Result<T> {
    match (flag, config) {
        (Some(value), _) => Ok(value),
        (None, Some(name)) => T::from_str(name, true).map_err(|_| {
            let expected: Vec<String> = T::value_variants()
                .iter()
                .filter_map(ValueEnum::to_possible_value)
                .map(|v| v.get_name().to_string())
                .collect();
            CliError::Usage(format!(
                "unknown {key} '{name}' in config (expected one of: {})",
                expected.join(", ")
            ))
            .into()
        }),
        (None, None) => Ok(T::default()),
    }
}

/// Selected operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode<'a> {
    Test,
    Comports,
    Read(&'a Path),
    Verify(&'a Path),
    Program(&'a Path),
    Completions(Shell),
}

impl Cli {
    fn mode(&self) -> Option<Mode<'_>> {
        if self.test {
            Some(Mode::Test)
        } else if self.comports {
            Some(Mode::Comports)
        } else if let Some(path) = &self.read {
            Some(Mode::Read(path))
        } else if let Some(path) = &self.verify {
            Some(Mode::Verify(path))
        } else if let Some(path) = &self.prog {
            Some(Mode::Program(path))
        } else {
            self.completions.map(Mode::Completions)
        }
    }
}

/// Everything a bootloader operation needs, after merging flags, env and config.
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    /// Explicit port, if any source named one.
    pub port: Option<String>,
    /// Session parameters.
    pub boot: BootConfig,
    /// Transport implementation.
    pub transport: TransportKind,
    /// Serial line parity.
    pub parity: Parity,
    /// Suppress status output.
    pub quiet: bool,
}

impl Settings {
    /// Merge command-line values over the configuration files.
    fn resolve(cli: &Cli, config: &Config) -> Result<Self> {
        let conn = &config.connection;

        let address = cli.adr.or(conn.address).unwrap_or(1);
        let boot = BootConfig::new(address).map_err(|e| CliError::Usage(e.to_string()))?;

        let begin = cli
            .beginmemory
            .or(config.memory.begin)
            .unwrap_or(MEMORY_START);
        let end = cli.endmemory.or(config.memory.end).unwrap_or(MEMORY_END);
        let range =
            MemoryRange::resolve(begin, end).map_err(|e| CliError::Usage(e.to_string()))?;

        let timeout = cli
            .timeout_ms
            .or(conn.timeout_ms)
            .map_or(DEFAULT_TIMEOUT, Duration::from_millis);

        let transport = flag_or_config(cli.transport, conn.transport.as_deref(), "transport")?;
        let parity: LineParity = flag_or_config(cli.parity, conn.parity.as_deref(), "parity")?;

        Ok(Self {
            port: cli.port.clone().or_else(|| conn.port.clone()),
            boot: boot
                .with_range(range)
                .with_timeout(timeout)
                .with_baud_rate(cli.baud.or(conn.baud).unwrap_or(DEFAULT_BAUD)),
            transport,
            parity: parity.into(),
            quiet: cli.quiet,
        })
    }
}

/// Parse a 32-bit integer: `0x` hex, `0o` octal, `0b` binary or decimal.
/// Underscore separators are allowed.
fn parse_u32(s: &str) -> Result<u32, String> {
    let s: String = s.trim().chars().filter(|c| *c != '_').collect();
    let lower = s.to_ascii_lowercase();
    let parsed = if let Some(hex) = lower.strip_prefix("0x") {
        u32::from_str_radix(hex, 16)
    } else if let Some(oct) = lower.strip_prefix("0o") {
        u32::from_str_radix(oct, 8)
    } else if let Some(bin) = lower.strip_prefix("0b") {
        u32::from_str_radix(bin, 2)
    } else {
        lower.parse()
    };
    parsed.map_err(|e| format!("Invalid address '{s}': {e}"))
}

/// Accept only paths to existing files.
fn existing_file(s: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(s);
    if path.is_file() {
        Ok(path)
    } else {
        Err(format!("file not found: {s}"))
    }
}

/// Exit code for a failed run: 2 for usage errors, 1 otherwise.
fn exit_code(err: &anyhow::Error) -> ExitCode {
    if err.downcast_ref::<CliError>().is_some() {
        ExitCode::from(2)
    } else {
        ExitCode::FAILURE
    }
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

fn run(cli: &Cli) -> Result<()> {
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    let Some(mode) = cli.mode() else {
        return Err(CliError::Usage("no mode selected".to_string()).into());
    };

    match mode {
        Mode::Completions(shell) => {
            commands::completions::cmd_completions(shell);
            Ok(())
        },
        Mode::Comports => commands::ports::cmd_list_ports(cli.json),
        Mode::Test => commands::transfer::cmd_test(&Settings::resolve(cli, &config)?),
        Mode::Read(path) => commands::transfer::cmd_read(&Settings::resolve(cli, &config)?, path),
        Mode::Verify(path) => {
            commands::transfer::cmd_verify(&Settings::resolve(cli, &config)?, path)
        },
        Mode::Program(path) => {
            commands::transfer::cmd_program(&Settings::resolve(cli, &config)?, path)
        },
    }
}

fn main() -> ExitCode {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();
    init_logging(&cli);

    debug!(
        "rtuboot v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            exit_code(&err)
        },
    }
}
