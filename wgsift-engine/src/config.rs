//! Engine configuration
//!
//! TOML-backed configuration read at start and written back on rule
//! mutation. The persisted file also carries the DNS backup blob and
//! the last-active timestamp (see [`crate::store`]).
//!
//! # Example Configuration
//!
//! ```toml
//! [[rules]]
//! pattern = "*.example.com"
//! tunnel = true
//!
//! [vpn]
//! interface = "wg0"
//! peer_public_key = "base64key..."
//!
//! [dns]
//! listen_port = 5353
//! tunnel_upstream = { host = "8.8.8.8", port = 53 }
//! direct_upstream = { host = "1.1.1.1", port = 53 }
//!
//! [sni]
//! listen_port = 1080
//! ```

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use sift_rules::Rule;

use crate::error::{Error, Result};

/// Upstream DNS server address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamAddr {
    pub host: String,
    pub port: u16,
}

impl UpstreamAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Resolve to a socket address
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| Error::Config(format!("cannot resolve {}:{}: {}", self.host, self.port, e)))?
            .next()
            .ok_or_else(|| {
                Error::Config(format!("no address for {}:{}", self.host, self.port))
            })
    }
}

/// VPN interface/peer the engine mutates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpnConfig {
    /// WireGuard interface name, e.g. `wg0`
    pub interface: String,
    /// Public key of the peer whose allowed-ips we extend
    pub peer_public_key: String,
}

/// DNS proxy settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    /// Loopback UDP port the proxy listens on
    pub listen_port: u16,
    /// Upstream for tunnel-classified names
    pub tunnel_upstream: UpstreamAddr,
    /// Upstream for direct-classified names
    pub direct_upstream: UpstreamAddr,
    /// Strip AAAA records so v4-only routing cannot be bypassed
    pub filter_aaaa: bool,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            listen_port: 5353,
            tunnel_upstream: UpstreamAddr::new("8.8.8.8", 53),
            direct_upstream: UpstreamAddr::new("1.1.1.1", 53),
            filter_aaaa: false,
        }
    }
}

/// SNI proxy settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SniConfig {
    /// Loopback TCP port for SOCKS5
    pub listen_port: u16,
    /// VPN-side SOCKS endpoint for tunnel-classified connections
    pub vpn_socks: Option<UpstreamAddr>,
}

impl Default for SniConfig {
    fn default() -> Self {
        Self {
            listen_port: 1080,
            vpn_socks: None,
        }
    }
}

/// Route manager settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutesConfig {
    /// Lifetime of an injected route
    pub ttl_secs: u64,
    /// Cleanup tick period
    pub cleanup_interval_secs: u64,
}

impl Default for RoutesConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            cleanup_interval_secs: 60,
        }
    }
}

impl RoutesConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Routing rules
    pub rules: Vec<Rule>,

    /// VPN target; required for routing, optional for rule editing
    pub vpn: Option<VpnConfig>,

    /// DNS proxy settings
    pub dns: DnsConfig,

    /// SNI proxy settings
    pub sni: SniConfig,

    /// Route manager settings
    pub routes: RoutesConfig,

    /// Password for the privileged runner, supplied out of band.
    /// When unset, escalation relies on cached sudo credentials.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sudo_password: Option<String>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        for rule in &self.rules {
            sift_rules::validate_pattern(&rule.pattern)?;
        }

        if let Some(ref vpn) = self.vpn {
            if vpn.interface.is_empty() {
                return Err(Error::Config("vpn.interface is required".into()));
            }
            if vpn.peer_public_key.len() != 44 {
                return Err(Error::Config(
                    "vpn.peer_public_key must be a 44-character base64 key".into(),
                ));
            }
        }

        if self.routes.ttl_secs == 0 {
            return Err(Error::Config("routes.ttl_secs must be non-zero".into()));
        }
        if self.routes.cleanup_interval_secs == 0 {
            return Err(Error::Config(
                "routes.cleanup_interval_secs must be non-zero".into(),
            ));
        }

        Ok(())
    }

    /// Generate a commented sample configuration
    pub fn sample() -> String {
        r#"# wgsift configuration

# Names matching a tunnel rule egress through the VPN; everything
# else goes direct. `*.example.com` matches strict subdomains only.
[[rules]]
pattern = "*.example.com"
tunnel = true

[[rules]]
pattern = "example.com"
tunnel = true

# The WireGuard interface and peer whose allowed-ips are extended
# with resolved addresses. Replace the key with the peer's public key
# from `wg show`.
[vpn]
interface = "wg0"
peer_public_key = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="

[dns]
# Loopback port the DNS proxy listens on; the OS resolver is pointed
# here via the port-53 redirect.
listen_port = 5353
tunnel_upstream = { host = "8.8.8.8", port = 53 }
direct_upstream = { host = "1.1.1.1", port = 53 }
# Strip AAAA answers so v6 cannot bypass v4-only routing.
filter_aaaa = false

[sni]
# SOCKS5 port for applications that need per-connection egress
# (domains sharing an IP).
listen_port = 1080
# VPN-side SOCKS endpoint; tunnel connections dial through it.
# vpn_socks = { host = "10.0.0.1", port = 1080 }

[routes]
# Injected /32 routes expire after this many seconds.
ttl_secs = 300
cleanup_interval_secs = 60
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.dns.listen_port, 5353);
        assert_eq!(config.dns.tunnel_upstream, UpstreamAddr::new("8.8.8.8", 53));
        assert_eq!(config.dns.direct_upstream, UpstreamAddr::new("1.1.1.1", 53));
        assert_eq!(config.sni.listen_port, 1080);
        assert_eq!(config.routes.ttl_secs, 300);
        assert_eq!(config.routes.cleanup_interval_secs, 60);
    }

    #[test]
    fn test_sample_parses() {
        let config = Config::from_toml(&Config::sample()).unwrap();
        assert_eq!(config.rules.len(), 2);
        assert!(config.vpn.is_some());
    }

    #[test]
    fn test_round_trip() {
        let mut config = Config::default();
        config.rules.push(Rule {
            pattern: "*.example.com".into(),
            tunnel: true,
        });
        config.vpn = Some(VpnConfig {
            interface: "wg0".into(),
            peer_public_key: "UEVFUnBlZXJQRUVScGVlclBFRVJwZWVyUEVFUnBlZXI=".into(),
        });

        let text = toml::to_string_pretty(&config).unwrap();
        let parsed = Config::from_toml(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_invalid_rule_rejected() {
        let text = r#"
[[rules]]
pattern = "bad..pattern"
tunnel = true
"#;
        assert!(Config::from_toml(text).is_err());
    }

    #[test]
    fn test_bad_peer_key_rejected() {
        let text = r#"
[vpn]
interface = "wg0"
peer_public_key = "short"
"#;
        assert!(Config::from_toml(text).is_err());
    }

    #[test]
    fn test_upstream_socket_addr() {
        let upstream = UpstreamAddr::new("8.8.8.8", 53);
        assert_eq!(
            upstream.socket_addr().unwrap(),
            "8.8.8.8:53".parse::<SocketAddr>().unwrap()
        );
    }
}
