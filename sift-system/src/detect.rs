//! Advisory tunnel detection
//!
//! Probes for (a) native WireGuard interfaces via the control tool,
//! (b) third-party VPN clients whose CLIs are installed, and (c) OS
//! tunnel interface names. The result is informational only; routing
//! proceeds only once an interface/peer target is configured.

use crate::runner::CommandRunner;
use crate::wg::parse_dump;

/// Third-party VPN CLIs worth probing for
const THIRD_PARTY_CLIS: &[&str] = &["tailscale", "mullvad", "warp-cli", "openvpn"];

/// Interface name prefixes that indicate a tunnel device
const TUNNEL_IFACE_PREFIXES: &[&str] = &["wg", "utun", "tun"];

/// Summary of what the probes found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelStatus {
    /// A WireGuard interface is up and visible to the control tool
    NativeAvailable,
    /// No native interface, but a known VPN client is installed
    ThirdPartyDetected(String),
    /// Nothing tunnel-like found
    NoTunnel,
    /// Probes failed; no statement possible
    Unknown,
}

impl std::fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelStatus::NativeAvailable => write!(f, "native WireGuard interface available"),
            TunnelStatus::ThirdPartyDetected(name) => {
                write!(f, "third-party VPN client detected: {}", name)
            }
            TunnelStatus::NoTunnel => write!(f, "no tunnel detected"),
            TunnelStatus::Unknown => write!(f, "tunnel state unknown"),
        }
    }
}

/// Run all probes and summarize.
pub async fn detect_tunnels(runner: &dyn CommandRunner) -> TunnelStatus {
    let (native, third_party, os_ifaces) = tokio::join!(
        probe_native(runner),
        probe_third_party(runner),
        probe_os_interfaces(runner),
    );

    match (native, third_party, os_ifaces) {
        (Some(true), _, _) => TunnelStatus::NativeAvailable,
        (_, Some(name), _) => TunnelStatus::ThirdPartyDetected(name),
        // A tunnel interface without wg visibility is likely managed
        // by someone else; still report it.
        (_, None, Some(true)) => TunnelStatus::ThirdPartyDetected("unknown tunnel interface".into()),
        (Some(false), None, Some(false)) => TunnelStatus::NoTunnel,
        _ => TunnelStatus::Unknown,
    }
}

async fn probe_native(runner: &dyn CommandRunner) -> Option<bool> {
    let output = runner.run("wg", &["show", "all", "dump"]).await.ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    Some(parse_dump(&text).map(|i| !i.is_empty()).unwrap_or(false))
}

async fn probe_third_party(runner: &dyn CommandRunner) -> Option<String> {
    for cli in THIRD_PARTY_CLIS.iter().copied() {
        if let Ok(output) = runner.run("which", &[cli]).await {
            if output.status.success() {
                return Some(cli.to_string());
            }
        }
    }
    None
}

async fn probe_os_interfaces(runner: &dyn CommandRunner) -> Option<bool> {
    #[cfg(target_os = "linux")]
    let listing = runner.run("ip", &["-o", "link", "show"]).await;
    #[cfg(not(target_os = "linux"))]
    let listing = runner.run("ifconfig", &["-l"]).await;

    let output = listing.ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    Some(text.split_whitespace().any(|word| {
        let name = word.trim_end_matches(':');
        TUNNEL_IFACE_PREFIXES
            .iter()
            .any(|prefix| name.starts_with(prefix) && name.len() > prefix.len())
    }))
}
