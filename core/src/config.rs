/// Configuration management
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const DEFAULT_DATA_DIR: &str = ".chatsync";
const DEFAULT_ID_PREFIX: &str = "local-";
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Sync cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the on-disk message cache
    pub data_dir: PathBuf,

    /// Prefix for locally generated message ids (keeps them apart from server ids)
    pub local_id_prefix: String,

    /// Buffer size of the view event channel; slow subscribers lag past this
    pub event_capacity: usize,

    /// Cached messages still pending at load time were interrupted mid-send;
    /// restore them as failed so the view can offer a retry
    pub restore_pending_as_failed: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            local_id_prefix: DEFAULT_ID_PREFIX.to_string(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            restore_pending_as_failed: true,
        }
    }
}

impl Config {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut config: Config = serde_json::from_str(&raw)
            .map_err(|e| SyncError::Config(format!("Invalid config {}: {}", path.display(), e)))?;

        // Env overrides (nice for scripts)
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.local_id_prefix.is_empty() {
            return Err(SyncError::Config(
                "local_id_prefix must not be empty".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(SyncError::Config(
                "event_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("CHATSYNC_DATA_DIR") {
            if !dir.is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }
        if let Ok(prefix) = std::env::var("CHATSYNC_ID_PREFIX") {
            self.local_id_prefix = prefix;
        }
        if let Some(cap) = std::env::var("CHATSYNC_EVENT_CAPACITY")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
        {
            self.event_capacity = cap;
        }
    }
}
