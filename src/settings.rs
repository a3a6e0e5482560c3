// src/settings.rs
//
// Connection settings, the TOML application config, and the versioned
// configuration cell shared between the receive worker and its callers.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;

use crate::filter::{FilterSet, MaskFilter};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to write {path}: {message}")]
    Write { path: PathBuf, message: String },
}

// ============================================================================
// Connection Settings
// ============================================================================

/// Which transport adapter to open
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Arduino-style bridge speaking the text line protocol over a serial port
    #[default]
    SerialLine,
    /// Linux native CAN interface
    #[serde(rename = "socketcan")]
    SocketCan,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default)]
    pub device_kind: DeviceKind,
    /// Serial port path (`/dev/ttyACM0`, `COM3`) or interface name (`can0`)
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default = "default_can_bitrate")]
    pub can_bitrate: u32,
    #[serde(default = "default_serial_baudrate")]
    pub serial_baudrate: u32,
    #[serde(default)]
    pub listen_only: bool,
    /// Pushed down to adapters that filter in hardware
    #[serde(default)]
    pub hardware_filters: MaskFilter,
    /// Reconfigure the SocketCAN link (bitrate, listen-only) via pkexec before opening
    #[serde(default)]
    pub configure_link: bool,
}

fn default_channel() -> String {
    if cfg!(target_os = "windows") {
        "COM3".to_string()
    } else {
        "/dev/ttyACM0".to_string()
    }
}
fn default_can_bitrate() -> u32 {
    500_000
}
fn default_serial_baudrate() -> u32 {
    115_200
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            device_kind: DeviceKind::default(),
            channel: default_channel(),
            can_bitrate: default_can_bitrate(),
            serial_baudrate: default_serial_baudrate(),
            listen_only: false,
            hardware_filters: MaskFilter::default(),
            configure_link: false,
        }
    }
}

// ============================================================================
// Application Config
// ============================================================================

/// Everything read from the user's config file. Missing sections default.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub connection: ConnectionSettings,
    /// Software filters. `filters.mask` mirrors `connection.hardware_filters`
    /// when the config is loaded.
    #[serde(default)]
    pub filters: FilterSet,
    /// Delay between a scenario's impulse and its periodic phase
    #[serde(default = "default_scenario_delay_ms")]
    pub scenario_delay_ms: u64,
}

fn default_scenario_delay_ms() -> u64 {
    500
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionSettings::default(),
            filters: FilterSet::default(),
            scenario_delay_ms: default_scenario_delay_ms(),
        }
    }
}

impl AppConfig {
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        let mut config: AppConfig = toml::from_str(text)?;
        if config.filters.mask == MaskFilter::default() {
            config.filters.mask = config.connection.hardware_filters;
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&content).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tlog!(
            "[settings] Loaded {} ({:?} on {})",
            path.display(),
            config.connection.device_kind,
            config.connection.channel
        );
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        let write_err = |message: String| SettingsError::Write {
            path: path.to_path_buf(),
            message,
        };
        let content = toml::to_string_pretty(self).map_err(|e| write_err(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| write_err(e.to_string()))
    }
}

// ============================================================================
// Versioned Shared Configuration
// ============================================================================

/// An owned configuration value with snapshot-and-swap updates.
///
/// Readers take an `Arc` snapshot and never see a half-applied update. Each
/// `replace` bumps the version so a reader can cheaply tell whether its
/// snapshot is stale.
pub struct Shared<T> {
    inner: Arc<RwLock<(u64, Arc<T>)>>,
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Shared<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(RwLock::new((0, Arc::new(value)))),
        }
    }

    /// Snapshot of the current value
    pub fn current(&self) -> Arc<T> {
        match self.inner.read() {
            Ok(guard) => Arc::clone(&guard.1),
            Err(poisoned) => Arc::clone(&poisoned.into_inner().1),
        }
    }

    pub fn version(&self) -> u64 {
        match self.inner.read() {
            Ok(guard) => guard.0,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    /// Atomically install a new value, returning its version
    pub fn replace(&self, value: T) -> u64 {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.0 += 1;
        guard.1 = Arc::new(value);
        guard.0
    }
}

impl<T: Default> Default for Shared<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

// ============================================================================
// Tests
// ============================================================================
