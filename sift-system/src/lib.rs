//! sift-system - OS adapters for the routing engine
//!
//! Three narrow surfaces over external tooling:
//!
//! - [`runner`]: command execution with explicit, injectable
//!   privilege escalation. Nothing in this crate escalates implicitly.
//! - [`wg`]: the WireGuard control tool (`wg show all dump`,
//!   `wg set ... allowed-ips ...`) plus advisory tunnel detection.
//! - [`dns`]: system resolver redirection with capture/restore and
//!   crash recovery, with a macOS (networksetup + PF anchor) and a
//!   Linux (systemd-resolved drop-in or resolv.conf rewrite +
//!   iptables REDIRECT) backend.

pub mod detect;
pub mod dns;
pub mod error;
#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "macos")]
pub mod macos;
pub mod runner;
pub mod wg;

pub use detect::{detect_tunnels, TunnelStatus};
pub use dns::{DnsBackup, SystemDns};
pub use error::{Error, Result};
pub use runner::{CommandRunner, PrivilegedRunner, SystemRunner};
pub use wg::{Interface, Peer, WgCli, WgControl, WgTarget};
