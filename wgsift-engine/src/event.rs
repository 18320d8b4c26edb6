//! Engine events and state
//!
//! Every observable action of the routing core is one variant of
//! [`EngineEvent`]. Subscribers are well known at boot, so events fan
//! out through a `broadcast` channel plus an optional handler trait;
//! there is no string-keyed dispatch.

use std::net::{Ipv4Addr, SocketAddr};

use sift_rules::Conflict;

/// Engine lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Not running
    Stopped,
    /// Start sequence in progress
    Starting,
    /// All components serving
    Running,
    /// Stop sequence in progress
    Stopping,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EngineState::Stopped => "stopped",
            EngineState::Starting => "starting",
            EngineState::Running => "running",
            EngineState::Stopping => "stopping",
        };
        write!(f, "{}", s)
    }
}

/// Why an address was not injected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The address serves both tunnel and direct names
    Conflict,
    /// The address was in the peer's allowed-ips before we started
    OriginalAllowedIp,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Conflict => write!(f, "conflict"),
            SkipReason::OriginalAllowedIp => write!(f, "original-allowed-ips"),
        }
    }
}

/// Events emitted by the routing engine
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Lifecycle transition
    StateChanged { old: EngineState, new: EngineState },

    /// A DNS query was classified
    Query {
        client: SocketAddr,
        name: String,
        qtype: String,
        tunnel: bool,
        matched_rule: Option<String>,
    },

    /// A DNS response was relayed
    Response {
        name: String,
        ips: Vec<Ipv4Addr>,
        min_ttl: u32,
    },

    /// Resolved addresses were recorded for routing
    RouteInjection {
        domain: String,
        ips: Vec<Ipv4Addr>,
        tunnel: bool,
        conflict: Option<Conflict>,
    },

    /// An ip entered the conflicting state
    ConflictDetected(Conflict),

    /// An ip left the conflicting state
    ConflictResolved { ip: Ipv4Addr },

    /// Routes were added to the peer's allowed-ips
    RoutesInjected { domain: String, ips: Vec<Ipv4Addr> },

    /// Routes were removed from the peer's allowed-ips
    RoutesRemoved { ips: Vec<Ipv4Addr> },

    /// TTL expiry removed routes
    RoutesExpired { count: usize, ips: Vec<Ipv4Addr> },

    /// All tracked routes were removed
    RoutesCleared { count: usize },

    /// An injection was refused
    RouteSkipped {
        ip: Ipv4Addr,
        domain: String,
        reason: SkipReason,
    },

    /// The SNI proxy opened a relayed connection
    SniConnection {
        target: String,
        port: u16,
        tunnel: bool,
    },

    /// A recovered error somewhere in the core
    Error { component: &'static str, message: String },
}

/// Receives engine events
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_event(&self, event: EngineEvent);
}

/// Default handler that writes events to the log
pub struct LoggingEventHandler;

#[async_trait::async_trait]
impl EventHandler for LoggingEventHandler {
    async fn on_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::StateChanged { old, new } => {
                log::info!("engine state: {} -> {}", old, new);
            }
            EngineEvent::Query {
                name,
                tunnel,
                matched_rule,
                ..
            } => {
                log::debug!(
                    "query {} -> {}{}",
                    name,
                    if tunnel { "tunnel" } else { "direct" },
                    matched_rule
                        .map(|r| format!(" (rule {})", r))
                        .unwrap_or_default()
                );
            }
            EngineEvent::Response { name, ips, min_ttl } => {
                log::debug!("response {}: {:?} (ttl {})", name, ips, min_ttl);
            }
            EngineEvent::RouteInjection {
                domain,
                ips,
                tunnel,
                conflict,
            } => {
                log::debug!(
                    "recorded {} {:?} tunnel={} conflict={}",
                    domain,
                    ips,
                    tunnel,
                    conflict.is_some()
                );
            }
            EngineEvent::ConflictDetected(conflict) => {
                log::warn!(
                    "ip {} now serves tunnel {:?} and direct {:?}; routing by SNI",
                    conflict.ip,
                    conflict.tunnel_domains,
                    conflict.direct_domains
                );
            }
            EngineEvent::ConflictResolved { ip } => {
                log::info!("ip {} no longer conflicted", ip);
            }
            EngineEvent::RoutesInjected { domain, ips } => {
                log::info!("injected {:?} for {}", ips, domain);
            }
            EngineEvent::RoutesRemoved { ips } => {
                log::info!("removed routes {:?}", ips);
            }
            EngineEvent::RoutesExpired { count, ips } => {
                log::info!("expired {} route(s): {:?}", count, ips);
            }
            EngineEvent::RoutesCleared { count } => {
                log::info!("cleared {} route(s)", count);
            }
            EngineEvent::RouteSkipped { ip, domain, reason } => {
                log::info!("skipped {} for {} ({})", ip, domain, reason);
            }
            EngineEvent::SniConnection {
                target,
                port,
                tunnel,
            } => {
                log::debug!(
                    "SOCKS {}:{} via {}",
                    target,
                    port,
                    if tunnel { "tunnel" } else { "direct" }
                );
            }
            EngineEvent::Error { component, message } => {
                log::warn!("{}: {}", component, message);
            }
        }
    }
}
