//! TOML configuration with serde-backed defaults.
//!
//! Search order: the `--config` path if given, then
//! `/etc/bbsyncer/bbsyncer.toml`, then built-in defaults. A file that
//! exists but fails to parse is logged and skipped rather than aborting a
//! field sync over a typo.
//!
//! ```toml
//! [serial]
//! port = ""                 # empty = auto-detect /dev/ttyACM*
//! baud = 115200
//!
//! [storage]
//! storage_path = "/mnt/bbsyncer-logs"
//! min_free_space_mb = 200
//!
//! [sync]
//! erase_after_sync = true
//! chunk_size_bytes = 16384
//! pipeline_depth = 2
//!
//! [led]
//! backend = "sysfs"         # or "gpio"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

const SYSTEM_CONFIG_PATH: &str = "/etc/bbsyncer/bbsyncer.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub serial: SerialConfig,
    pub storage: StorageConfig,
    pub sync: SyncConfig,
    pub led: LedConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SerialConfig {
    /// Empty string means auto-detect the first `/dev/ttyACM*`.
    pub port: String,
    pub baud: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud: crate::msp::transport::BAUD_RATE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub storage_path: PathBuf,
    /// Headroom kept free beyond the flash image itself.
    pub min_free_space_mb: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("/mnt/bbsyncer-logs"),
            min_free_space_mb: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub erase_after_sync: bool,
    pub chunk_size_bytes: u32,
    pub pipeline_depth: u8,
    /// Ask the FC for Huffman-compressed chunks when it advertises them.
    /// Off by default: raw reads are slower over USB but have no decode
    /// step between the wire and the file.
    pub allow_compressed_read: bool,
    pub request_timeout_ms: u32,
    pub chunk_timeout_ms: u32,
    pub sync_timeout_ms: u32,
    pub erase_poll_interval_ms: u32,
    pub erase_timeout_ms: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            erase_after_sync: true,
            chunk_size_bytes: 16 * 1024,
            pipeline_depth: 2,
            allow_compressed_read: false,
            request_timeout_ms: 2_000,
            chunk_timeout_ms: 3_000,
            sync_timeout_ms: 600_000,
            erase_poll_interval_ms: 2_000,
            erase_timeout_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LedConfig {
    /// `"sysfs"` or `"gpio"`.
    pub backend: String,
    /// LED class directory with `brightness` and `trigger` files.
    pub sysfs_dir: PathBuf,
    pub gpio_pin: u32,
}

impl Default for LedConfig {
    fn default() -> Self {
        Self {
            backend: "sysfs".to_string(),
            sysfs_dir: PathBuf::from("/sys/class/leds/led0"),
            gpio_pin: 17,
        }
    }
}

impl Config {
    /// Load configuration, falling back through the search order.
    pub fn load(explicit: Option<&Path>) -> Config {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(p) = explicit {
            candidates.push(p.to_path_buf());
        }
        candidates.push(PathBuf::from(SYSTEM_CONFIG_PATH));

        for candidate in candidates {
            match std::fs::read_to_string(&candidate) {
                Ok(text) => match toml::from_str::<Config>(&text) {
                    Ok(cfg) => {
                        debug!("loaded config from {}", candidate.display());
                        return cfg;
                    }
                    Err(e) => warn!("ignoring config {}: {e}", candidate.display()),
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("cannot read config {}: {e}", candidate.display()),
            }
        }
        debug!("using built-in default config");
        Config::default()
    }

    pub fn headroom_bytes(&self) -> u64 {
        u64::from(self.storage.min_free_space_mb) * 1024 * 1024
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.sync.request_timeout_ms.into())
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.sync.chunk_timeout_ms.into())
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync.sync_timeout_ms.into())
    }

    pub fn erase_poll_interval(&self) -> Duration {
        Duration::from_millis(self.sync.erase_poll_interval_ms.into())
    }

    pub fn erase_timeout(&self) -> Duration {
        Duration::from_millis(self.sync.erase_timeout_ms.into())
    }
}
