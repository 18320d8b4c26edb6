//! WireGuard control tool adapter
//!
//! A narrow wrapper over the `wg` command line: interface listing via
//! `wg show all dump` and allowed-ips mutation via `wg set`. Mutation
//! is a read-modify-write of the peer's allowed-ips CSV, so calls must
//! be serialized by the owner (the route manager does).

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::runner::{expect_success, CommandRunner};

/// Length of a base64-encoded WireGuard key
const WG_KEY_LEN: usize = 44;

/// Placeholder the tool accepts when a peer would otherwise have an
/// empty allowed-ips set
pub const EMPTY_ALLOWED_IPS_SENTINEL: &str = "0.0.0.0/32";

/// One peer from the dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub public_key: String,
    pub endpoint: Option<String>,
    pub allowed_ips: Vec<String>,
    pub latest_handshake: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// One interface from the dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub public_key: String,
    pub listen_port: Option<u16>,
    pub peers: Vec<Peer>,
}

/// The peer whose allowed-ips set the engine mutates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WgTarget {
    pub interface: String,
    pub peer_public_key: String,
}

/// Allowed-ips mutation surface used by the route manager
#[async_trait]
pub trait WgControl: Send + Sync {
    /// Current allowed-ips of the configured peer
    async fn get_allowed_ips(&self) -> Result<Vec<String>>;

    /// Ensure the given CIDRs are present (idempotent)
    async fn add_allowed_ips(&self, ips: &[String]) -> Result<()>;

    /// Ensure the given CIDRs are absent (idempotent)
    async fn remove_allowed_ips(&self, ips: &[String]) -> Result<()>;
}

/// Parse the tab-separated output of `wg show all dump`.
///
/// Interface rows have five columns with the public key third; peer
/// rows have nine. Rows that do not carry a 44-char base64 key in the
/// expected column are rejected.
pub fn parse_dump(text: &str) -> Result<Vec<Interface>> {
    let mut interfaces: Vec<Interface> = Vec::new();

    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        match fields.len() {
            5 => {
                let public_key = fields[2];
                if public_key.len() != WG_KEY_LEN {
                    return Err(Error::Parse {
                        what: "wg dump interface line",
                        detail: format!("unexpected public key column: {}", line),
                    });
                }
                interfaces.push(Interface {
                    name: fields[0].to_string(),
                    public_key: public_key.to_string(),
                    listen_port: fields[3].parse().ok(),
                    peers: Vec::new(),
                });
            }
            9 => {
                let public_key = fields[1];
                if public_key.len() != WG_KEY_LEN {
                    return Err(Error::Parse {
                        what: "wg dump peer line",
                        detail: format!("unexpected public key column: {}", line),
                    });
                }
                let iface = fields[0];
                let Some(interface) = interfaces.iter_mut().rev().find(|i| i.name == iface) else {
                    return Err(Error::Parse {
                        what: "wg dump peer line",
                        detail: format!("peer for unknown interface {}", iface),
                    });
                };
                interface.peers.push(Peer {
                    public_key: public_key.to_string(),
                    endpoint: match fields[3] {
                        "(none)" => None,
                        endpoint => Some(endpoint.to_string()),
                    },
                    allowed_ips: split_csv(fields[4]),
                    latest_handshake: fields[5].parse().unwrap_or(0),
                    rx_bytes: fields[6].parse().unwrap_or(0),
                    tx_bytes: fields[7].parse().unwrap_or(0),
                });
            }
            n => {
                return Err(Error::Parse {
                    what: "wg dump",
                    detail: format!("unexpected column count {} in: {}", n, line),
                });
            }
        }
    }

    Ok(interfaces)
}

fn split_csv(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != "(none)")
        .map(str::to_string)
        .collect()
}

/// Union preserving current order, appending missing entries
pub fn merge_allowed_ips(current: &[String], add: &[String]) -> Vec<String> {
    let mut merged = current.to_vec();
    for ip in add {
        if !merged.contains(ip) {
            merged.push(ip.clone());
        }
    }
    merged
}

/// Difference preserving order; the sentinel keeps the set non-empty
pub fn subtract_allowed_ips(current: &[String], remove: &[String]) -> Vec<String> {
    let mut remaining: Vec<String> = current
        .iter()
        .filter(|ip| !remove.contains(ip))
        .cloned()
        .collect();
    if remaining.is_empty() {
        remaining.push(EMPTY_ALLOWED_IPS_SENTINEL.to_string());
    }
    remaining
}

/// `wg` command-line adapter
pub struct WgCli {
    runner: Arc<dyn CommandRunner>,
    privileged: Arc<dyn CommandRunner>,
    target: RwLock<Option<WgTarget>>,
}

impl WgCli {
    pub fn new(runner: Arc<dyn CommandRunner>, privileged: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            privileged,
            target: RwLock::new(None),
        }
    }

    /// Select the interface/peer to operate on
    pub async fn set_config(&self, target: WgTarget) {
        log::info!(
            "wg target: interface={} peer={}",
            target.interface,
            target.peer_public_key
        );
        *self.target.write().await = Some(target);
    }

    /// Whether the `wg` binary is on the PATH
    pub async fn is_available(&self) -> bool {
        matches!(
            self.runner.run("which", &["wg"]).await,
            Ok(output) if output.status.success()
        )
    }

    /// Whether the configured interface exists with the configured peer
    pub async fn is_active(&self) -> Result<bool> {
        let target = self.target().await?;
        let interfaces = self.list_interfaces().await?;
        Ok(interfaces.iter().any(|i| {
            i.name == target.interface
                && i.peers.iter().any(|p| p.public_key == target.peer_public_key)
        }))
    }

    /// All WireGuard interfaces visible to the tool
    pub async fn list_interfaces(&self) -> Result<Vec<Interface>> {
        let dump = self.wg(&["show", "all", "dump"]).await?;
        parse_dump(&dump)
    }

    /// A single interface by name
    pub async fn get_interface(&self, name: &str) -> Result<Option<Interface>> {
        Ok(self
            .list_interfaces()
            .await?
            .into_iter()
            .find(|i| i.name == name))
    }

    async fn target(&self) -> Result<WgTarget> {
        self.target.read().await.clone().ok_or(Error::NotConfigured)
    }

    /// Run `wg` unprivileged, falling back to the privileged runner.
    async fn wg(&self, args: &[&str]) -> Result<String> {
        let output = self.runner.run("wg", args).await?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        log::debug!(
            "wg {:?} failed unprivileged ({}), retrying elevated",
            args,
            String::from_utf8_lossy(&output.stderr).trim()
        );
        let output = self.privileged.run("wg", args).await?;
        expect_success("wg", &output)
    }

    async fn set_allowed_ips(&self, target: &WgTarget, ips: &[String]) -> Result<()> {
        let csv = ips.join(",");
        self.wg(&[
            "set",
            &target.interface,
            "peer",
            &target.peer_public_key,
            "allowed-ips",
            &csv,
        ])
        .await?;
        Ok(())
    }
}

#[async_trait]
impl WgControl for WgCli {
    async fn get_allowed_ips(&self) -> Result<Vec<String>> {
        let target = self.target().await?;
        let interfaces = self.list_interfaces().await?;
        let peer = interfaces
            .iter()
            .find(|i| i.name == target.interface)
            .and_then(|i| {
                i.peers
                    .iter()
                    .find(|p| p.public_key == target.peer_public_key)
            })
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "{} peer {}",
                    target.interface, target.peer_public_key
                ))
            })?;
        Ok(peer.allowed_ips.clone())
    }

    async fn add_allowed_ips(&self, ips: &[String]) -> Result<()> {
        let target = self.target().await?;
        let current = self.get_allowed_ips().await?;
        let merged = merge_allowed_ips(&current, ips);
        if merged == current {
            return Ok(());
        }
        self.set_allowed_ips(&target, &merged).await
    }

    async fn remove_allowed_ips(&self, ips: &[String]) -> Result<()> {
        let target = self.target().await?;
        let current = self.get_allowed_ips().await?;
        let remaining = subtract_allowed_ips(&current, ips);
        if remaining == current {
            return Ok(());
        }
        self.set_allowed_ips(&target, &remaining).await
    }
}
