//! Configuration file support for mbboot.
//!
//! Configuration is loaded from multiple sources with the following
//! priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (MBBOOT_*)
//! 3. Local config file (./mbboot.toml)
//! 4. Global config file (~/.config/mbboot/config.toml)

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Serial connection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: Option<String>,
    /// Baud rate.
    pub baud: Option<u32>,
    /// Data bits (7 or 8).
    pub data_bits: Option<u8>,
    /// Parity ("none", "odd", "even").
    pub parity: Option<String>,
    /// Stop bits (1 or 2).
    pub stop_bits: Option<u8>,
}

/// Modbus exchange settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModbusConfig {
    /// Server (device) address.
    pub server: Option<u8>,
    /// Per-exchange response timeout in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Retries after a timed-out exchange.
    pub retries: Option<u32>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Modbus settings.
    #[serde(default)]
    pub modbus: ModbusConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                if let Some(global_config) = Self::load_from_file(&global_path) {
                    debug!("Loaded global config from {}", global_path.display());
                    config.merge(global_config);
                }
            }
        }

        if let Some(local_config) = Self::load_from_file(Path::new("mbboot.toml")) {
            debug!("Loaded local config from mbboot.toml");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
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

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse TOML config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "mbboot").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one (the other wins where set).
    fn merge(&mut self, other: Self) {
        if other.connection.port.is_some() {
            self.connection.port = other.connection.port;
        }
        if other.connection.baud.is_some() {
            self.connection.baud = other.connection.baud;
        }
        if other.connection.data_bits.is_some() {
            self.connection.data_bits = other.connection.data_bits;
        }
        if other.connection.parity.is_some() {
            self.connection.parity = other.connection.parity;
        }
        if other.connection.stop_bits.is_some() {
            self.connection.stop_bits = other.connection.stop_bits;
        }

        if other.modbus.server.is_some() {
            self.modbus.server = other.modbus.server;
        }
        if other.modbus.timeout_ms.is_some() {
            self.modbus.timeout_ms = other.modbus.timeout_ms;
        }
        if other.modbus.retries.is_some() {
            self.modbus.retries = other.modbus.retries;
        }
    }
}
