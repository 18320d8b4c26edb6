//! Persisted engine state
//!
//! One TOML file holds the configuration plus the runtime leftovers
//! that must survive a crash: the DNS backup blob and the last-active
//! timestamp. Read at start, written on mutation.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use sift_system::DnsBackup;

use crate::config::Config;
use crate::error::Result;

/// Everything persisted between runs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoredState {
    /// Unix timestamp of the last start/stop transition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_active: Option<u64>,

    /// User configuration (rules, VPN target, ports)
    pub config: Config,

    /// Resolver backup from an active (or crashed) run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_backup: Option<DnsBackup>,
}

impl StoredState {
    /// Load state from a file, defaulting when it does not exist.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            log::info!("no state file at {}, starting fresh", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let state: StoredState = toml::from_str(&content)?;
        state.config.validate()?;
        Ok(state)
    }

    /// Write state back, creating parent directories as needed.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Stamp the last-active timestamp with the current time.
    pub fn touch(&mut self) {
        self.last_active = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .ok()
            .map(|d| d.as_secs());
    }
}

/// Default state file location
pub fn default_store_path() -> PathBuf {
    PathBuf::from("wgsift.toml")
}
