//! Tunables for both ends of a connection, loadable from TOML.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
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
}

/// Reads and parses a TOML file into any config type.
pub fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Server time reconstruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeBaseConfig {
    /// Delta error above which the clock snaps to the newest frame.
    pub reset_threshold_ms: i32,
    /// Delta error above which the gap is halved instead of drifted.
    pub fast_threshold_ms: i32,
    /// How close to the newest frame counts as extrapolating.
    pub extrapolation_lead_ms: i32,
    /// Subtracted from the output time; trades latency for smoothness.
    pub time_nudge_ms: i32,
    /// Drift correction only runs at 0 or 1.
    pub timescale: f32,
    pub show_time_delta: bool,
}

impl Default for TimeBaseConfig {
    fn default() -> Self {
        Self {
            reset_threshold_ms: 300,
            fast_threshold_ms: 100,
            extrapolation_lead_ms: 5,
            time_nudge_ms: 0,
            timescale: 1.0,
            show_time_delta: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub time_base: TimeBaseConfig,
    /// Set when the server runs in the same process; enables level shots.
    pub local_server: bool,
    /// How many recent user commands each outgoing packet repeats.
    pub max_user_commands_per_packet: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            time_base: TimeBaseConfig::default(),
            local_server: false,
            max_user_commands_per_packet: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub tick_rate: u32,
    pub max_clients: usize,
    /// Stamped on every outbound client header; changes on map restart.
    pub server_id: u32,
    pub hostname: String,
    pub map_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick_rate: 20,
            max_clients: 1,
            server_id: 1,
            hostname: "tether".to_string(),
            map_name: "arena".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn tick_interval_ms(&self) -> u32 {
        1000 / self.tick_rate.max(1)
    }
}
