//! wgsift-engine - domain-based split tunneling over WireGuard
//!
//! The engine composes the routing core explicitly: the domain
//! matcher and conflict detector are shared with the DNS and SNI
//! proxies, resolved addresses flow into the route manager, and the
//! route manager keeps the VPN peer's allowed-ips set in sync with a
//! TTL-bounded table of injected `/32` routes.
//!
//! ```text
//! client ──UDP──> DnsProxy ──classify──> DomainMatcher
//!                    │                        ▲
//!                    ├──record──> ConflictDetector
//!                    │                        │
//!                    └──RouteRequest──> RouteManager ──wg set──> peer
//!
//! app ──SOCKS5──> SniProxy ──classify──> DomainMatcher
//!                    └──dial: direct │ VPN-side SOCKS
//! ```
//!
//! One engine per process is the natural lifecycle, but nothing here
//! assumes it.

pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod routes;
pub mod store;

pub use config::{Config, DnsConfig, RoutesConfig, SniConfig, UpstreamAddr, VpnConfig};
pub use engine::{Engine, EngineStats};
pub use error::{Error, Result};
pub use event::{EngineEvent, EngineState, EventHandler, LoggingEventHandler, SkipReason};
pub use routes::{InjectedRoute, RouteManager, RouteStats};
pub use store::StoredState;
