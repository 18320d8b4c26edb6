//! Tunnel/direct conflict tracking for resolved addresses
//!
//! Every (domain, ip) pair observed by the DNS proxy is recorded here
//! with the classification taken at observation time. An IP answered
//! for at least one tunnel name and at least one direct name within the
//! freshness window is in conflict: routing it by destination alone
//! would send the direct name's traffic through the tunnel, so the
//! route injector refuses it and the SNI proxy takes over.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use crate::matcher::normalize_name;

/// Default freshness window for recorded mappings
pub const DEFAULT_MAPPING_TTL: Duration = Duration::from_secs(300);

/// One observed (domain, ip) resolution
#[derive(Debug, Clone)]
pub struct Mapping {
    pub domain: String,
    pub ip: Ipv4Addr,
    pub tunnel: bool,
    pub observed_at: Instant,
}

impl Mapping {
    fn is_stale(&self, ttl: Duration) -> bool {
        self.observed_at.elapsed() > ttl
    }
}

/// An IP serving both tunnel and direct names
#[derive(Debug, Clone)]
pub struct Conflict {
    pub ip: Ipv4Addr,
    /// Tunnel-classified domains resolving to this ip (deduplicated, sorted)
    pub tunnel_domains: Vec<String>,
    /// Direct-classified domains resolving to this ip (deduplicated, sorted)
    pub direct_domains: Vec<String>,
    pub detected_at: Instant,
}

/// Transition reported by a mutating detector operation.
///
/// The detector itself is synchronous; the engine forwards these as
/// events to its subscribers.
#[derive(Debug, Clone)]
pub enum ConflictChange {
    /// The ip entered the conflicting state
    Detected(Conflict),
    /// The ip left the conflicting state
    Resolved(Ipv4Addr),
}

/// Detector counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectorStats {
    /// Fresh mappings currently tracked
    pub mappings: usize,
    /// Distinct domains with at least one tracked ip
    pub domains: usize,
    /// Distinct ips with at least one fresh mapping
    pub ips: usize,
    /// Active conflicts
    pub conflicts: usize,
}

/// Tracks domain→ip observations and derives per-ip conflicts.
///
/// Mappings older than the ttl are elided from conflict evaluation and
/// pruned by [`ConflictDetector::cleanup`]. Operations are individually
/// mutually exclusive; the caller holds the lock.
#[derive(Debug)]
pub struct ConflictDetector {
    mapping_ttl: Duration,
    by_ip: HashMap<Ipv4Addr, Vec<Mapping>>,
    by_domain: HashMap<String, HashSet<Ipv4Addr>>,
    conflicts: HashMap<Ipv4Addr, Conflict>,
}

impl Default for ConflictDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ConflictDetector {
    /// Create a detector with the default 5 minute mapping ttl
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_MAPPING_TTL)
    }

    /// Create a detector with a custom mapping ttl
    pub fn with_ttl(mapping_ttl: Duration) -> Self {
        Self {
            mapping_ttl,
            by_ip: HashMap::new(),
            by_domain: HashMap::new(),
            conflicts: HashMap::new(),
        }
    }

    /// Record one observed resolution and re-evaluate the ip.
    pub fn record(&mut self, domain: &str, ip: Ipv4Addr, tunnel: bool) -> Option<ConflictChange> {
        let domain = normalize_name(domain);
        if domain.is_empty() {
            return None;
        }

        let mappings = self.by_ip.entry(ip).or_default();
        mappings.retain(|m| m.domain != domain);
        mappings.push(Mapping {
            domain: domain.clone(),
            ip,
            tunnel,
            observed_at: Instant::now(),
        });
        self.by_domain.entry(domain).or_default().insert(ip);

        self.reevaluate(ip)
    }

    /// Record a whole answer set for one domain.
    pub fn record_batch(
        &mut self,
        domain: &str,
        ips: &[Ipv4Addr],
        tunnel: bool,
    ) -> Vec<ConflictChange> {
        ips.iter()
            .filter_map(|ip| self.record(domain, *ip, tunnel))
            .collect()
    }

    /// Whether the ip is currently in conflict
    pub fn has_conflict(&self, ip: Ipv4Addr) -> bool {
        self.conflicts.contains_key(&ip)
    }

    /// The conflict for an ip, if any
    pub fn conflict_for(&self, ip: Ipv4Addr) -> Option<&Conflict> {
        self.conflicts.get(&ip)
    }

    /// Snapshot of all active conflicts
    pub fn conflicts(&self) -> Vec<Conflict> {
        self.conflicts.values().cloned().collect()
    }

    /// Drop every mapping for a domain and re-evaluate the affected ips.
    ///
    /// Called when a rule is removed so stale observations do not pin a
    /// conflict alive.
    pub fn remove_domain(&mut self, domain: &str) -> Vec<ConflictChange> {
        let domain = normalize_name(domain);
        let Some(ips) = self.by_domain.remove(&domain) else {
            return Vec::new();
        };

        let mut changes = Vec::new();
        for ip in ips {
            if let Some(mappings) = self.by_ip.get_mut(&ip) {
                mappings.retain(|m| m.domain != domain);
            }
            if let Some(change) = self.reevaluate(ip) {
                changes.push(change);
            }
        }
        changes
    }

    /// Prune stale mappings everywhere and recompute conflicts.
    pub fn cleanup(&mut self) -> Vec<ConflictChange> {
        let ttl = self.mapping_ttl;
        let mut dropped: Vec<(Ipv4Addr, String)> = Vec::new();

        for (ip, mappings) in self.by_ip.iter_mut() {
            mappings.retain(|m| {
                let stale = m.is_stale(ttl);
                if stale {
                    dropped.push((*ip, m.domain.clone()));
                }
                !stale
            });
        }

        for (ip, domain) in &dropped {
            let still_mapped = self
                .by_ip
                .get(ip)
                .is_some_and(|ms| ms.iter().any(|m| &m.domain == domain));
            if !still_mapped {
                if let Some(ips) = self.by_domain.get_mut(domain) {
                    ips.remove(ip);
                    if ips.is_empty() {
                        self.by_domain.remove(domain);
                    }
                }
            }
        }

        let affected: BTreeSet<Ipv4Addr> = dropped.into_iter().map(|(ip, _)| ip).collect();
        let mut changes = Vec::new();
        for ip in affected {
            if let Some(change) = self.reevaluate(ip) {
                changes.push(change);
            }
        }
        changes
    }

    /// Drop all state
    pub fn clear(&mut self) {
        self.by_ip.clear();
        self.by_domain.clear();
        self.conflicts.clear();
    }

    /// Current counters
    pub fn stats(&self) -> DetectorStats {
        DetectorStats {
            mappings: self.by_ip.values().map(Vec::len).sum(),
            domains: self.by_domain.len(),
            ips: self.by_ip.values().filter(|m| !m.is_empty()).count(),
            conflicts: self.conflicts.len(),
        }
    }

    /// Recompute the conflict state of one ip from its fresh mappings.
    fn reevaluate(&mut self, ip: Ipv4Addr) -> Option<ConflictChange> {
        let ttl = self.mapping_ttl;
        let (tunnel_domains, direct_domains) = match self.by_ip.get_mut(&ip) {
            Some(mappings) => {
                mappings.retain(|m| !m.is_stale(ttl));
                let mut tunnel = BTreeSet::new();
                let mut direct = BTreeSet::new();
                for m in mappings.iter() {
                    if m.tunnel {
                        tunnel.insert(m.domain.clone());
                    } else {
                        direct.insert(m.domain.clone());
                    }
                }
                (tunnel, direct)
            }
            None => (BTreeSet::new(), BTreeSet::new()),
        };

        if self.by_ip.get(&ip).is_some_and(Vec::is_empty) {
            self.by_ip.remove(&ip);
        }

        let conflicting = !tunnel_domains.is_empty() && !direct_domains.is_empty();
        if conflicting {
            let was_conflicting = self.conflicts.contains_key(&ip);
            let conflict = Conflict {
                ip,
                tunnel_domains: tunnel_domains.into_iter().collect(),
                direct_domains: direct_domains.into_iter().collect(),
                detected_at: self
                    .conflicts
                    .get(&ip)
                    .map_or_else(Instant::now, |c| c.detected_at),
            };
            self.conflicts.insert(ip, conflict.clone());
            if was_conflicting {
                None
            } else {
                log::info!(
                    "conflict detected on {}: tunnel={:?} direct={:?}",
                    ip,
                    conflict.tunnel_domains,
                    conflict.direct_domains
                );
                Some(ConflictChange::Detected(conflict))
            }
        } else if self.conflicts.remove(&ip).is_some() {
            log::info!("conflict resolved on {}", ip);
            Some(ConflictChange::Resolved(ip))
        } else {
            None
        }
    }
}
