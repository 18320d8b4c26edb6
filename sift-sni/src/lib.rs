//! sift-sni - SOCKS5 proxy with TLS SNI inspection
//!
//! Destination-IP routing cannot split two domains that share an
//! address (CDN collisions). Applications that opt into this SOCKS5
//! proxy get per-connection egress selection instead: the CONNECT
//! target (or, for policy refinement, the ClientHello's server_name)
//! is classified through the rule set and the stream is dialed either
//! directly or through a VPN-side SOCKS.
//!
//! The proxy speaks the RFC 1928 no-auth CONNECT subset.

pub mod error;
mod server;
mod sni;
mod upstream;

pub use error::{Error, Result};
pub use server::{SniEvent, SniProxy, SniProxyConfig};
pub use sni::parse_sni;
pub use upstream::socks_connect;
