//! Configuration for the AgniIO daemon
//!
//! Loads configuration from a TOML file. Every section has working defaults
//! so the daemon can start without a config file for bench testing.

use crate::error::Result;
use crate::fusion::FusionConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub network: NetworkConfig,
    pub calibration: CalibrationConfig,
    pub engine: EngineConfig,
    pub fusion: FusionConfig,
    pub health: HealthConfig,
    pub directory: DirectoryConfig,
    pub packet_log: PacketLogConfig,
    pub logging: LoggingConfig,
}

/// Network configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// TCP bind address for inbound device connections
    pub bind_address: String,
    /// TCP bind address for outbound event subscribers
    pub pub_address: String,
    /// Port devices listen on, used when dialing out for auto-reconnect
    pub device_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:6000".to_string(),
            pub_address: "0.0.0.0:6001".to_string(),
            device_port: 7000,
        }
    }
}

/// Calibration configuration
///
/// `default_scale`/`default_offset` apply before any calibration block has
/// been accepted for a connection (grids produced with these carry the
/// stale-fallback provenance).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub default_scale: f64,
    pub default_offset: f64,
    /// Legacy variant: unconditionally re-fetch the calibration EEPROM on a
    /// fixed per-connection timer. Absent (the default) disables it.
    pub refetch_interval_secs: Option<u64>,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            default_scale: 0.02,
            default_offset: 0.0,
            refetch_interval_secs: None,
        }
    }
}

impl CalibrationConfig {
    pub fn refetch_interval(&self) -> Option<Duration> {
        self.refetch_interval_secs.map(Duration::from_secs)
    }
}

/// Connection engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// On-demand polling mode: instead of the one-shot start-streaming
    /// command, request a single frame at this interval. Absent (the
    /// default) selects continuous streaming.
    pub poll_interval_secs: Option<u64>,
    /// Capacity of the bounded outbound event queue (oldest entries are
    /// dropped when full)
    pub event_queue_capacity: usize,
    /// Wire format for published events: "json" or "postcard"
    pub wire_format: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: None,
            event_queue_capacity: 256,
            wire_format: "json".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval_secs.map(Duration::from_secs)
    }
}

/// Device health monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Seconds without activity before a device is considered offline
    pub liveness_timeout_secs: u64,
    /// Seconds between automatic reconnection attempts
    pub retry_interval_secs: u64,
    /// Maximum automatic reconnection attempts before requiring a manual
    /// reconnect
    pub max_attempts: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            liveness_timeout_secs: 30,
            retry_interval_secs: 10,
            max_attempts: 5,
        }
    }
}

impl HealthConfig {
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

/// Device directory persistence configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Path of the persisted IP-to-location mapping
    pub path: String,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            path: "devices.toml".to_string(),
        }
    }
}

/// Packet log configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PacketLogConfig {
    pub path: String,
    /// Rotate once the active file exceeds this size
    pub max_bytes: u64,
    /// Number of rotated files to keep
    pub keep: u32,
}

impl Default for PacketLogConfig {
    fn default() -> Self {
        Self {
            path: "packets.log".to_string(),
            max_bytes: 1024 * 1024,
            keep: 3,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            calibration: CalibrationConfig::default(),
            engine: EngineConfig::default(),
            fusion: FusionConfig::default(),
            health: HealthConfig::default(),
            directory: DirectoryConfig::default(),
            packet_log: PacketLogConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }
}
