//! Configuration file support for rtuboot.
//!
//! Each setting is taken from the first source that provides it:
//! command-line flags, then `RTUBOOT_*` environment variables, then
//! `./rtuboot.toml`, then the per-user `config.toml` (for example
//! `~/.config/rtuboot/config.toml`).
//!
//! ```toml
//! [connection]
//! port = "/dev/ttyUSB0"
//! baud = 115200
//! address = 1
//! timeout_ms = 3000
//! transport = "listener"
//! parity = "even"
//!
//! [memory]
//! begin = 0x08001000
//! end = 0x08020000
//! ```

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the local configuration file.
pub const LOCAL_CONFIG: &str = "rtuboot.toml";

/// `[connection]` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Port to open when none is given on the command line.
    pub port: Option<String>,
    /// Line speed.
    pub baud: Option<u32>,
    /// Slave address of the target.
    pub address: Option<u8>,
    /// Response timeout in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Transport implementation ("blocking" or "listener").
    pub transport: Option<String>,
    /// Line parity ("none", "even" or "odd").
    pub parity: Option<String>,
}

/// `[memory]` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// First flash address.
    pub begin: Option<u32>,
    /// End address, or a length when below the flash base.
    pub end: Option<u32>,
}

/// Settings read from the TOML config files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Serial link and slave.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Flash range.
    #[serde(default)]
    pub memory: MemoryConfig,
}

impl Config {
    /// Per-user file first, then `./rtuboot.toml` on top of it.
    pub fn load() -> Self {
        let sources = Self::global_config_path()
            .into_iter()
            .chain(std::iter::once(PathBuf::from(LOCAL_CONFIG)));

        sources.fold(Self::default(), |mut config, path| {
            if let Some(found) = Self::load_from_file(&path) {
                debug!("Using config {}", path.display());
                config.merge(found);
            }
            config
        })
    }

    /// Load only `path` (the `--config` flag). Falls back to defaults.
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Parse one file. Missing and unreadable files yield `None`.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Invalid TOML in config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Cannot read config file {}: {e}", path.display());
                None
            },
        }
    }

    /// Per-user config directory, if the platform has one.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "rtuboot").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// `config.toml` inside [`Config::global_config_dir`].
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Overlay every value `other` sets.
    fn merge(&mut self, other: Self) {
        let conn = other.connection;
        if conn.port.is_some() {
            self.connection.port = conn.port;
        }
        if conn.baud.is_some() {
            self.connection.baud = conn.baud;
        }
        if conn.address.is_some() {
            self.connection.address = conn.address;
        }
        if conn.timeout_ms.is_some() {
            self.connection.timeout_ms = conn.timeout_ms;
        }
        if conn.transport.is_some() {
            self.connection.transport = conn.transport;
        }
        if conn.parity.is_some() {
            self.connection.parity = conn.parity;
        }

        if other.memory.begin.is_some() {
            self.memory.begin = other.memory.begin;
        }
        if other.memory.end.is_some() {
            self.memory.end = other.memory.end;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_by_default() {
        let config = Config::default();
        assert!(config.connection.port.is_none());
        assert!(config.connection.baud.is_none());
        assert!(config.connection.address.is_none());
        assert!(config.memory.begin.is_none());
        assert!(config.memory.end.is_none());
    }

    #[test]
    fn test_config_merge() {
        let mut base = Config::default();
        base.connection.port = Some("/dev/ttyUSB0".to_string());
        base.connection.baud = Some(9600);

        let mut other = Config::default();
        other.connection.baud = Some(115200);
        other.memory.begin = Some(0x0800_2000);

        base.merge(other);

        assert_eq!(base.connection.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(base.connection.baud, Some(115200));
        assert_eq!(base.memory.begin, Some(0x0800_2000));
    }

    #[test]
    fn test_merge_keeps_unset_values() {
        let mut base = Config::default();
        base.connection.address = Some(7);
        base.connection.transport = Some("listener".to_string());

        base.merge(Config::default());

        assert_eq!(base.connection.address, Some(7));
        assert_eq!(base.connection.transport.as_deref(), Some("listener"));
    }

    #[test]
    fn test_parse_all_keys() {
        let text = r#"
[connection]
port = "COM3"
baud = 57600
address = 12
timeout_ms = 500
transport = "listener"
parity = "even"

[memory]
begin = 0x08001000
end = 0x400
"#;
        let config: Config = toml::from_str(text).unwrap();
        assert_eq!(config.connection.port.as_deref(), Some("COM3"));
        assert_eq!(config.connection.baud, Some(57600));
        assert_eq!(config.connection.address, Some(12));
        assert_eq!(config.connection.timeout_ms, Some(500));
        assert_eq!(config.connection.transport.as_deref(), Some("listener"));
        assert_eq!(config.connection.parity.as_deref(), Some("even"));
        assert_eq!(config.memory.begin, Some(0x0800_1000));
        assert_eq!(config.memory.end, Some(0x400));
    }

    #[test]
    fn test_parse_empty_file() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.connection.port.is_none());
        assert!(config.memory.begin.is_none());
    }

    #[test]
    fn test_config_rejects_out_of_range_address() {
        // u8 field: 300 does not fit
        assert!(toml::from_str::<Config>("[connection]\naddress = 300\n").is_err());
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[connection]\nport = \"/dev/ttyUSB1\"\n[memory]\nbegin = 0x08004000\n",
        )
        .unwrap();

        let config = Config::load_from_path(&path);
        assert_eq!(config.connection.port.as_deref(), Some("/dev/ttyUSB1"));
        assert_eq!(config.memory.begin, Some(0x0800_4000));
    }

    #[test]
    fn test_load_from_path_invalid_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "invalid toml [[[").unwrap();

        let config = Config::load_from_path(&path);
        assert!(config.connection.port.is_none());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = Config::load_from_path(Path::new("/nonexistent/rtuboot/config.toml"));
        assert!(config.connection.port.is_none());
    }

    #[test]
    fn test_global_config_path() {
        if let Some(p) = Config::global_config_path() {
            assert!(p.to_str().unwrap().contains("rtuboot"));
            assert!(p.to_str().unwrap().ends_with("config.toml"));
        }
    }
}
