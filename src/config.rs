// SPDX-License-Identifier: GPL-3.0-only

//! Runtime configuration
//!
//! Stored as JSON under the user's config directory
//! (`~/.config/montage/config.json` on Linux). Missing fields take their
//! defaults, and a missing file yields [`Config::default`].

use crate::constants::{BitratePreset, pipeline, recovery, timing};
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Config file name inside the application config directory
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Position listener polling interval in milliseconds
    pub position_interval_ms: u64,
    /// Seconds of media buffered by each queue in front of a sink bin
    pub queue_buffer_seconds: f64,
    /// Consecutive error recoveries before giving up
    pub max_recovery_attempts: u32,
    /// Seconds an async state change may stay pending before recovery kicks in
    pub state_watchdog_secs: u64,
    /// Bitrate preset used when render settings do not set one
    pub bitrate_preset: BitratePreset,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            position_interval_ms: timing::POSITION_POLL_INTERVAL_MS,
            queue_buffer_seconds: pipeline::QUEUE_BUFFER_SECONDS,
            max_recovery_attempts: recovery::MAX_ATTEMPTS,
            state_watchdog_secs: timing::STATE_WATCHDOG_SECS,
            bitrate_preset: BitratePreset::default(),
        }
    }
}

impl Config {
    /// Default config file location
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("montage").join(CONFIG_FILE))
    }

    /// Load from the default location, falling back to defaults when absent
    pub fn load() -> Result<Self, ConfigError> {
        match Self::config_path() {
            Some(path) if path.exists() => Self::from_path(&path),
            _ => {
                debug!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load from an explicit file
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)?;
        info!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Write to an explicit file, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn position_interval(&self) -> Duration {
        Duration::from_millis(self.position_interval_ms.max(1))
    }

    pub fn queue_buffer(&self) -> Duration {
        Duration::from_secs_f64(self.queue_buffer_seconds.max(0.0))
    }

    pub fn state_watchdog(&self) -> Duration {
        Duration::from_secs(self.state_watchdog_secs)
    }
}
