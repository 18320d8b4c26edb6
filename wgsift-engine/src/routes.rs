//! Injected route table with TTL expiry
//!
//! The route manager owns the set of `/32` routes it has pushed into
//! the VPN peer's allowed-ips. Invariants:
//!
//! - every tracked cidr is in the peer's allowed-ips (up to the next
//!   reconciliation after a failed VPN call), and
//! - no tracked cidr was in the allowed-ips snapshot captured at
//!   start, so stopping restores exactly the user's configuration.
//!
//! All operations run under the owner's lock; VPN calls are never
//! issued concurrently.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ipnet::IpNet;
use tokio::sync::{broadcast, Mutex};

use sift_rules::ConflictDetector;
use sift_system::WgControl;

use crate::error::Result;
use crate::event::{EngineEvent, SkipReason};

/// One injected route
#[derive(Debug, Clone)]
pub struct InjectedRoute {
    pub ip: Ipv4Addr,
    /// Always `<ip>/32`; the uniqueness key
    pub ip_cidr: String,
    /// Domain that caused the injection (first writer wins)
    pub domain: String,
    pub injected_at: Instant,
    pub ttl: Duration,
    pub expires_at: Instant,
}

impl InjectedRoute {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// Route manager counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteStats {
    /// Routes currently tracked
    pub tracked: usize,
    /// Total successful injections
    pub injected: u64,
    /// Total routes dropped by TTL expiry
    pub expired: u64,
    /// Total injections refused because of a conflict
    pub skipped_conflict: u64,
    /// Total injections refused because the address was in the
    /// original allowed-ips snapshot
    pub skipped_original: u64,
    /// Total removals (explicit and conflict-driven)
    pub removed: u64,
}

/// Maintains injected `/32` routes in the VPN peer's allowed-ips set
pub struct RouteManager {
    wg: Arc<dyn WgControl>,
    detector: Arc<Mutex<ConflictDetector>>,
    events: broadcast::Sender<EngineEvent>,
    routes: HashMap<Ipv4Addr, InjectedRoute>,
    by_domain: HashMap<String, HashSet<Ipv4Addr>>,
    /// allowed-ips entries present before we started, normalized;
    /// never touched and never tracked
    original: HashSet<String>,
    started: bool,
    stats: RouteStats,
}

fn cidr_of(ip: Ipv4Addr) -> String {
    format!("{}/32", ip)
}

/// Normalize an allowed-ips entry for comparison
fn normalize_cidr(entry: &str) -> String {
    entry
        .trim()
        .parse::<IpNet>()
        .map(|net| net.to_string())
        .unwrap_or_else(|_| entry.trim().to_string())
}

impl RouteManager {
    pub fn new(
        wg: Arc<dyn WgControl>,
        detector: Arc<Mutex<ConflictDetector>>,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        Self {
            wg,
            detector,
            events,
            routes: HashMap::new(),
            by_domain: HashMap::new(),
            original: HashSet::new(),
            started: false,
            stats: RouteStats::default(),
        }
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    /// Capture the allowed-ips snapshot. Must run before any inject.
    pub async fn start(&mut self) -> Result<()> {
        let current = self.wg.get_allowed_ips().await?;
        self.original = current.iter().map(|e| normalize_cidr(e)).collect();
        self.started = true;
        log::info!(
            "route manager started; {} pre-existing allowed-ips entries protected",
            self.original.len()
        );
        Ok(())
    }

    /// Remove every tracked route and forget all state.
    ///
    /// The tables are cleared even when the VPN call fails, so a
    /// broken tool cannot wedge shutdown; the error is surfaced.
    pub async fn stop(&mut self) -> Result<()> {
        let result = self.clear_all().await;
        self.original.clear();
        self.started = false;
        result.map(|_| ())
    }

    /// Inject `/32` routes for a domain's resolved addresses.
    ///
    /// Conflicted addresses are skipped, already-tracked addresses
    /// have their TTL refreshed (same domain) or are left alone
    /// (first writer wins), snapshot members are never touched. The
    /// remainder is pushed in one VPN call; on failure the provisional
    /// table entries are rolled back.
    pub async fn inject(
        &mut self,
        domain: &str,
        ips: &[Ipv4Addr],
        ttl: Duration,
    ) -> Result<Vec<Ipv4Addr>> {
        let domain = sift_rules::normalize_name(domain);
        let now = Instant::now();
        let mut pending: Vec<Ipv4Addr> = Vec::new();

        {
            let detector = self.detector.lock().await;
            for &ip in ips {
                if detector.has_conflict(ip) {
                    self.stats.skipped_conflict += 1;
                    self.emit(EngineEvent::RouteSkipped {
                        ip,
                        domain: domain.clone(),
                        reason: SkipReason::Conflict,
                    });
                    continue;
                }

                if let Some(existing) = self.routes.get_mut(&ip) {
                    if existing.domain == domain {
                        existing.ttl = ttl;
                        existing.expires_at = now + ttl;
                    }
                    continue;
                }

                if self.original.contains(&cidr_of(ip)) {
                    self.stats.skipped_original += 1;
                    self.emit(EngineEvent::RouteSkipped {
                        ip,
                        domain: domain.clone(),
                        reason: SkipReason::OriginalAllowedIp,
                    });
                    continue;
                }

                pending.push(ip);
            }
        }

        if pending.is_empty() {
            return Ok(Vec::new());
        }

        // Provisional inserts, rolled back if the VPN call fails.
        for &ip in &pending {
            self.routes.insert(
                ip,
                InjectedRoute {
                    ip,
                    ip_cidr: cidr_of(ip),
                    domain: domain.clone(),
                    injected_at: now,
                    ttl,
                    expires_at: now + ttl,
                },
            );
            self.by_domain.entry(domain.clone()).or_default().insert(ip);
        }

        let cidrs: Vec<String> = pending.iter().map(|&ip| cidr_of(ip)).collect();
        match self.wg.add_allowed_ips(&cidrs).await {
            Ok(()) => {
                self.stats.injected += pending.len() as u64;
                self.stats.tracked = self.routes.len();
                self.emit(EngineEvent::RoutesInjected {
                    domain,
                    ips: pending.clone(),
                });
                Ok(pending)
            }
            Err(e) => {
                for ip in &pending {
                    self.forget(*ip);
                }
                Err(e.into())
            }
        }
    }

    /// Remove one tracked route. Returns whether it was tracked.
    pub async fn remove(&mut self, ip: Ipv4Addr) -> Result<bool> {
        if !self.routes.contains_key(&ip) {
            return Ok(false);
        }
        self.remove_batch(&[ip]).await?;
        Ok(true)
    }

    /// Remove every route injected for a domain.
    pub async fn remove_for_domain(&mut self, domain: &str) -> Result<Vec<Ipv4Addr>> {
        let domain = sift_rules::normalize_name(domain);
        let ips: Vec<Ipv4Addr> = self
            .by_domain
            .get(&domain)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        if !ips.is_empty() {
            self.remove_batch(&ips).await?;
        }
        Ok(ips)
    }

    /// Remove every tracked route. Tables are cleared even on VPN
    /// failure.
    pub async fn clear_all(&mut self) -> Result<usize> {
        let count = self.routes.len();
        if count == 0 {
            return Ok(0);
        }

        let cidrs: Vec<String> = self.routes.values().map(|r| r.ip_cidr.clone()).collect();
        let result = self.wg.remove_allowed_ips(&cidrs).await;

        self.routes.clear();
        self.by_domain.clear();
        self.stats.removed += count as u64;
        self.stats.tracked = 0;
        self.emit(EngineEvent::RoutesCleared { count });

        result?;
        Ok(count)
    }

    /// Drop expired routes and routes whose ip has since become
    /// conflicted. Failures leave the routes tracked for the next
    /// tick.
    pub async fn cleanup_expired(&mut self) -> Result<()> {
        let now = Instant::now();
        let expired: Vec<Ipv4Addr> = self
            .routes
            .values()
            .filter(|r| r.is_expired(now))
            .map(|r| r.ip)
            .collect();

        let conflicted: Vec<Ipv4Addr> = {
            let detector = self.detector.lock().await;
            self.routes
                .values()
                .filter(|r| !r.is_expired(now) && detector.has_conflict(r.ip))
                .map(|r| r.ip)
                .collect()
        };

        if !expired.is_empty() {
            let cidrs: Vec<String> = expired.iter().map(|&ip| cidr_of(ip)).collect();
            match self.wg.remove_allowed_ips(&cidrs).await {
                Ok(()) => {
                    for &ip in &expired {
                        self.forget(ip);
                    }
                    self.stats.expired += expired.len() as u64;
                    self.emit(EngineEvent::RoutesExpired {
                        count: expired.len(),
                        ips: expired,
                    });
                }
                Err(e) => {
                    self.emit(EngineEvent::Error {
                        component: "route-manager",
                        message: format!("expiry removal failed, will retry: {}", e),
                    });
                }
            }
        }

        if !conflicted.is_empty() {
            let cidrs: Vec<String> = conflicted.iter().map(|&ip| cidr_of(ip)).collect();
            match self.wg.remove_allowed_ips(&cidrs).await {
                Ok(()) => {
                    for &ip in &conflicted {
                        self.forget(ip);
                        self.stats.removed += 1;
                    }
                    self.emit(EngineEvent::RoutesRemoved { ips: conflicted });
                }
                Err(e) => {
                    self.emit(EngineEvent::Error {
                        component: "route-manager",
                        message: format!("conflict removal failed, will retry: {}", e),
                    });
                }
            }
        }

        self.stats.tracked = self.routes.len();
        Ok(())
    }

    /// All tracked routes
    pub fn routes(&self) -> Vec<InjectedRoute> {
        self.routes.values().cloned().collect()
    }

    /// Tracked addresses for a domain
    pub fn for_domain(&self, domain: &str) -> Vec<Ipv4Addr> {
        self.by_domain
            .get(&sift_rules::normalize_name(domain))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether any route is tracked for the domain
    pub fn has_for_domain(&self, domain: &str) -> bool {
        !self.for_domain(domain).is_empty()
    }

    /// Current counters
    pub fn stats(&self) -> RouteStats {
        let mut stats = self.stats.clone();
        stats.tracked = self.routes.len();
        stats
    }

    async fn remove_batch(&mut self, ips: &[Ipv4Addr]) -> Result<()> {
        let cidrs: Vec<String> = ips.iter().map(|&ip| cidr_of(ip)).collect();
        self.wg.remove_allowed_ips(&cidrs).await?;
        for &ip in ips {
            self.forget(ip);
            self.stats.removed += 1;
        }
        self.stats.tracked = self.routes.len();
        self.emit(EngineEvent::RoutesRemoved { ips: ips.to_vec() });
        Ok(())
    }

    fn forget(&mut self, ip: Ipv4Addr) {
        if let Some(route) = self.routes.remove(&ip) {
            if let Some(set) = self.by_domain.get_mut(&route.domain) {
                set.remove(&ip);
                if set.is_empty() {
                    self.by_domain.remove(&route.domain);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    const IP: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);
    const OTHER: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 9);
    const TTL: Duration = Duration::from_secs(300);

    /// In-memory allowed-ips set that can be told to fail
    struct MockWg {
        allowed: StdMutex<Vec<String>>,
        fail_next: StdMutex<bool>,
        add_calls: StdMutex<u64>,
    }

    impl MockWg {
        fn with_original(entries: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                allowed: StdMutex::new(entries.iter().map(|s| s.to_string()).collect()),
                fail_next: StdMutex::new(false),
                add_calls: StdMutex::new(0),
            })
        }

        fn allowed(&self) -> Vec<String> {
            self.allowed.lock().unwrap().clone()
        }

        fn fail_next(&self) {
            *self.fail_next.lock().unwrap() = true;
        }

        fn add_calls(&self) -> u64 {
            *self.add_calls.lock().unwrap()
        }

        fn take_failure(&self) -> bool {
            std::mem::take(&mut *self.fail_next.lock().unwrap())
        }
    }

    #[async_trait]
    impl WgControl for MockWg {
        async fn get_allowed_ips(&self) -> sift_system::Result<Vec<String>> {
            Ok(self.allowed())
        }

        async fn add_allowed_ips(&self, ips: &[String]) -> sift_system::Result<()> {
            if self.take_failure() {
                return Err(sift_system::Error::Command {
                    program: "wg".into(),
                    stderr: "injected failure".into(),
                });
            }
            *self.add_calls.lock().unwrap() += 1;
            let mut allowed = self.allowed.lock().unwrap();
            for ip in ips {
                if !allowed.contains(ip) {
                    allowed.push(ip.clone());
                }
            }
            Ok(())
        }

        async fn remove_allowed_ips(&self, ips: &[String]) -> sift_system::Result<()> {
            if self.take_failure() {
                return Err(sift_system::Error::Command {
                    program: "wg".into(),
                    stderr: "injected failure".into(),
                });
            }
            self.allowed.lock().unwrap().retain(|ip| !ips.contains(ip));
            Ok(())
        }
    }

    async fn manager(wg: Arc<MockWg>) -> (RouteManager, Arc<Mutex<ConflictDetector>>) {
        let detector = Arc::new(Mutex::new(ConflictDetector::new()));
        let (events, _) = broadcast::channel(256);
        let mut manager = RouteManager::new(wg, detector.clone(), events);
        manager.start().await.unwrap();
        (manager, detector)
    }

    #[tokio::test]
    async fn test_inject_adds_to_peer() {
        let wg = MockWg::with_original(&["10.0.0.2/32"]);
        let (mut m, _) = manager(wg.clone()).await;

        let injected = m.inject("example.com", &[IP], TTL).await.unwrap();
        assert_eq!(injected, vec![IP]);
        assert!(wg.allowed().contains(&"93.184.216.34/32".to_string()));
        assert!(m.has_for_domain("example.com"));
        assert_eq!(m.stats().tracked, 1);
    }

    #[tokio::test]
    async fn test_inject_is_idempotent() {
        let wg = MockWg::with_original(&[]);
        let (mut m, _) = manager(wg.clone()).await;

        m.inject("example.com", &[IP], TTL).await.unwrap();
        let second = m.inject("example.com", &[IP], TTL).await.unwrap();
        assert!(second.is_empty());
        assert_eq!(m.routes().len(), 1);
        // The VPN saw exactly one add.
        assert_eq!(wg.add_calls(), 1);
    }

    #[tokio::test]
    async fn test_first_writer_wins() {
        let wg = MockWg::with_original(&[]);
        let (mut m, _) = manager(wg).await;

        m.inject("first.test", &[IP], TTL).await.unwrap();
        m.inject("second.test", &[IP], TTL).await.unwrap();

        let routes = m.routes();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].domain, "first.test");
        assert!(!m.has_for_domain("second.test"));
    }

    #[tokio::test]
    async fn test_conflicted_ip_skipped() {
        let wg = MockWg::with_original(&[]);
        let (mut m, detector) = manager(wg.clone()).await;

        {
            let mut d = detector.lock().await;
            d.record("a.test", IP, true);
            d.record("b.test", IP, false);
        }

        let injected = m.inject("a.test", &[IP], TTL).await.unwrap();
        assert!(injected.is_empty());
        assert!(!wg.allowed().contains(&cidr_of(IP)));
        assert_eq!(m.stats().skipped_conflict, 1);
    }

    #[tokio::test]
    async fn test_original_entries_never_tracked() {
        let wg = MockWg::with_original(&["93.184.216.34/32"]);
        let (mut m, _) = manager(wg.clone()).await;

        let injected = m.inject("example.com", &[IP], TTL).await.unwrap();
        assert!(injected.is_empty());
        assert!(m.routes().is_empty());
        assert_eq!(m.stats().skipped_original, 1);

        // Stopping must not strip the user's own entry.
        m.stop().await.unwrap();
        assert!(wg.allowed().contains(&"93.184.216.34/32".to_string()));
    }

    #[tokio::test]
    async fn test_failed_add_rolls_back() {
        let wg = MockWg::with_original(&[]);
        let (mut m, _) = manager(wg.clone()).await;

        wg.fail_next();
        assert!(m.inject("example.com", &[IP], TTL).await.is_err());
        assert!(m.routes().is_empty());
        assert!(!m.has_for_domain("example.com"));
        assert!(wg.allowed().is_empty());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let wg = MockWg::with_original(&[]);
        let (mut m, _) = manager(wg.clone()).await;

        m.inject("fast.test", &[IP], Duration::from_millis(10))
            .await
            .unwrap();
        m.inject("slow.test", &[OTHER], TTL).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        m.cleanup_expired().await.unwrap();

        assert!(!wg.allowed().contains(&cidr_of(IP)));
        assert!(wg.allowed().contains(&cidr_of(OTHER)));
        assert_eq!(m.stats().expired, 1);
        assert_eq!(m.routes().len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_extends_ttl() {
        let wg = MockWg::with_original(&[]);
        let (mut m, _) = manager(wg.clone()).await;

        m.inject("example.com", &[IP], Duration::from_millis(20))
            .await
            .unwrap();
        // Re-resolution refreshes the deadline before it fires.
        m.inject("example.com", &[IP], TTL).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        m.cleanup_expired().await.unwrap();
        assert_eq!(m.routes().len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_removes_late_conflicts() {
        let wg = MockWg::with_original(&[]);
        let (mut m, detector) = manager(wg.clone()).await;

        m.inject("a.test", &[IP], TTL).await.unwrap();
        assert!(wg.allowed().contains(&cidr_of(IP)));

        // The conflict appears after the injection.
        {
            let mut d = detector.lock().await;
            d.record("a.test", IP, true);
            d.record("b.test", IP, false);
        }

        m.cleanup_expired().await.unwrap();
        assert!(!wg.allowed().contains(&cidr_of(IP)));
        assert!(m.routes().is_empty());
    }

    #[tokio::test]
    async fn test_failed_expiry_retries_next_tick() {
        let wg = MockWg::with_original(&[]);
        let (mut m, _) = manager(wg.clone()).await;

        m.inject("example.com", &[IP], Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        wg.fail_next();
        m.cleanup_expired().await.unwrap();
        // Still tracked; the next tick succeeds.
        assert_eq!(m.routes().len(), 1);

        m.cleanup_expired().await.unwrap();
        assert!(m.routes().is_empty());
        assert!(!wg.allowed().contains(&cidr_of(IP)));
    }

    #[tokio::test]
    async fn test_remove_for_domain() {
        let wg = MockWg::with_original(&[]);
        let (mut m, _) = manager(wg.clone()).await;

        m.inject("example.com", &[IP, OTHER], TTL).await.unwrap();
        let removed = m.remove_for_domain("example.com").await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(wg.allowed().is_empty());
        assert!(!m.has_for_domain("example.com"));
    }

    #[tokio::test]
    async fn test_stop_clears_tables_even_on_failure() {
        let wg = MockWg::with_original(&[]);
        let (mut m, _) = manager(wg.clone()).await;

        m.inject("example.com", &[IP], TTL).await.unwrap();
        wg.fail_next();
        assert!(m.stop().await.is_err());
        assert!(m.routes().is_empty());
    }
}
