//! System resolver redirection with capture/restore
//!
//! `configure` backs up the live resolver configuration, points it at
//! the loopback, and installs the port-53 redirect; `restore` is the
//! exact inverse. The backup is handed back to the caller so it can be
//! persisted for crash recovery: on the next start,
//! `check_for_stale_config` restores a previous run's redirection
//! before anything else happens.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
use crate::error::Error;
use crate::runner::CommandRunner;

/// Per-service resolver snapshot (macOS)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDns {
    pub service: String,
    /// Statically configured servers; empty means DHCP-provided
    pub servers: Vec<String>,
}

/// Opaque resolver backup, persisted across runs for crash recovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DnsBackup {
    /// macOS: per-network-service DNS server lists
    Macos { services: Vec<ServiceDns> },
    /// Linux with systemd-resolved: our drop-in was installed
    LinuxResolved,
    /// Linux without resolved: original resolv.conf contents
    LinuxResolvConf { original: String },
}

/// OS-level DNS redirection
pub struct SystemDns {
    runner: Arc<dyn CommandRunner>,
    privileged: Arc<dyn CommandRunner>,
    proxy_port: u16,
    configured: Option<DnsBackup>,
    #[cfg(target_os = "linux")]
    paths: crate::linux::LinuxPaths,
}

impl SystemDns {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        privileged: Arc<dyn CommandRunner>,
        proxy_port: u16,
    ) -> Self {
        Self {
            runner,
            privileged,
            proxy_port,
            configured: None,
            #[cfg(target_os = "linux")]
            paths: crate::linux::LinuxPaths::default(),
        }
    }

    /// Override resolver file locations (test support)
    #[cfg(target_os = "linux")]
    pub fn with_paths(mut self, paths: crate::linux::LinuxPaths) -> Self {
        self.paths = paths;
        self
    }

    /// Whether redirection is currently applied by this instance
    pub fn is_configured(&self) -> bool {
        self.configured.is_some()
    }

    /// Apply redirection. Returns the backup for persistence.
    ///
    /// A failure mid-apply rolls the configuration back before the
    /// error is surfaced. Calling configure twice is a no-op returning
    /// the original backup.
    pub async fn configure(&mut self) -> Result<DnsBackup> {
        if let Some(existing) = &self.configured {
            return Ok(existing.clone());
        }

        let backup = self.configure_platform().await?;
        self.configured = Some(backup.clone());
        Ok(backup)
    }

    /// Undo redirection applied by this instance. A no-op when nothing
    /// is configured.
    pub async fn restore(&mut self) -> Result<()> {
        let Some(backup) = self.configured.take() else {
            return Ok(());
        };
        self.restore_platform(&backup).await
    }

    /// Crash recovery: if a persisted backup exists and the live
    /// configuration still points at the loopback, restore it.
    /// Returns whether a stale configuration was cleaned up.
    pub async fn check_for_stale_config(&mut self, persisted: Option<&DnsBackup>) -> Result<bool> {
        let Some(backup) = persisted else {
            return Ok(false);
        };
        if !self.live_config_redirected().await {
            return Ok(false);
        }

        log::warn!("stale DNS redirection from a previous run; restoring");
        self.restore_platform(backup).await?;
        Ok(true)
    }

    #[cfg(target_os = "linux")]
    async fn configure_platform(&self) -> Result<DnsBackup> {
        crate::linux::configure(&self.runner, &self.privileged, self.proxy_port, &self.paths).await
    }

    #[cfg(target_os = "macos")]
    async fn configure_platform(&self) -> Result<DnsBackup> {
        crate::macos::configure(&self.runner, &self.privileged, self.proxy_port).await
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    async fn configure_platform(&self) -> Result<DnsBackup> {
        Err(Error::UnsupportedPlatform)
    }

    #[cfg(target_os = "linux")]
    async fn restore_platform(&self, backup: &DnsBackup) -> Result<()> {
        crate::linux::restore(
            &self.runner,
            &self.privileged,
            self.proxy_port,
            &self.paths,
            backup,
        )
        .await
    }

    #[cfg(target_os = "macos")]
    async fn restore_platform(&self, backup: &DnsBackup) -> Result<()> {
        crate::macos::restore(&self.runner, &self.privileged, backup).await
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    async fn restore_platform(&self, _backup: &DnsBackup) -> Result<()> {
        Err(Error::UnsupportedPlatform)
    }

    #[cfg(target_os = "linux")]
    async fn live_config_redirected(&self) -> bool {
        crate::linux::is_redirected(&self.paths).await
    }

    #[cfg(target_os = "macos")]
    async fn live_config_redirected(&self) -> bool {
        crate::macos::is_redirected(&self.runner).await
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    async fn live_config_redirected(&self) -> bool {
        false
    }
}
