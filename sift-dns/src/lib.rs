//! sift-dns - classifying DNS proxy
//!
//! A UDP DNS server that classifies each query's name through the
//! domain rule set, forwards the datagram verbatim to the matching
//! upstream (tunnel or direct), records every resolved IPv4 address in
//! the conflict detector, and reports the outcome over typed channels
//! so the engine can inject routes and fan out events.
//!
//! Requests and responses pass through byte-for-byte (EDNS0, cookies
//! and extended rcodes survive). The only synthesized packet is a
//! SERVFAIL when the upstream times out or errors.

mod answer;
pub mod error;
mod proxy;
mod upstream;

pub use answer::{extract_answer, filter_aaaa, synthesize_servfail, ResolvedAnswer};
pub use error::{Error, Result};
pub use proxy::{DnsEvent, DnsProxy, DnsProxyConfig, DnsStats, RouteRequest, DEFAULT_UPSTREAM_TIMEOUT};
pub use upstream::exchange;
