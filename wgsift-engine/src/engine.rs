//! Engine composition and lifecycle
//!
//! Owns every component of the routing core and wires them together
//! at start: shared matcher and detector, DNS proxy, SNI proxy, route
//! manager with its cleanup tick, and the system DNS redirection that
//! binds the whole thing to the host. Stop unwinds in reverse and
//! always restores the resolver.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;

use sift_dns::{DnsEvent, DnsProxy, DnsProxyConfig, DnsStats, RouteRequest};
use sift_rules::{ConflictChange, ConflictDetector, DetectorStats, DomainMatcher, Rule};
use sift_sni::{SniEvent, SniProxy, SniProxyConfig};
use sift_system::{
    detect_tunnels, CommandRunner, PrivilegedRunner, SystemDns, SystemRunner, TunnelStatus, WgCli,
    WgControl, WgTarget,
};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{EngineEvent, EngineState, EventHandler, LoggingEventHandler};
use crate::routes::{RouteManager, RouteStats};
use crate::store::StoredState;

/// Mapping-table cleanup period for the conflict detector
const DETECTOR_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Aggregate counters across the core
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub rules: usize,
    /// DNS proxy counters; zero while the proxy is not running
    pub dns: DnsStats,
    pub detector: DetectorStats,
    pub routes: RouteStats,
}

/// Event fan-out shared with background tasks
#[derive(Clone)]
struct EventSink {
    tx: broadcast::Sender<EngineEvent>,
    handler: Arc<dyn EventHandler>,
}

impl EventSink {
    async fn emit(&self, event: EngineEvent) {
        self.handler.on_event(event.clone()).await;
        let _ = self.tx.send(event);
    }
}

/// The split-tunneling routing engine
pub struct Engine {
    store_path: PathBuf,
    state: StoredState,
    engine_state: EngineState,

    matcher: Arc<RwLock<DomainMatcher>>,
    detector: Arc<Mutex<ConflictDetector>>,
    route_manager: Arc<Mutex<RouteManager>>,

    runner: Arc<dyn CommandRunner>,
    wg: Arc<WgCli>,
    system_dns: SystemDns,

    dns_proxy: Option<DnsProxy>,
    sni_proxy: Option<SniProxy>,

    sink: EventSink,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Load persisted state and assemble the engine. Nothing is
    /// started and nothing touches the OS yet.
    pub fn new<P: AsRef<Path>>(store_path: P) -> Result<Self> {
        let store_path = store_path.as_ref().to_path_buf();
        let state = StoredState::load(&store_path)?;

        let mut matcher = DomainMatcher::new();
        matcher.load(&state.config.rules)?;

        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        let privileged: Arc<dyn CommandRunner> = Arc::new(match &state.config.sudo_password {
            Some(password) => PrivilegedRunner::with_password(password.clone()),
            None => PrivilegedRunner::new(),
        });

        let wg = Arc::new(WgCli::new(runner.clone(), privileged.clone()));
        let system_dns = SystemDns::new(
            runner.clone(),
            privileged,
            state.config.dns.listen_port,
        );

        let detector = Arc::new(Mutex::new(ConflictDetector::new()));
        let (events_tx, _) = broadcast::channel(1024);
        let sink = EventSink {
            tx: events_tx.clone(),
            handler: Arc::new(LoggingEventHandler),
        };

        let route_manager = Arc::new(Mutex::new(RouteManager::new(
            wg.clone() as Arc<dyn WgControl>,
            detector.clone(),
            events_tx,
        )));

        Ok(Self {
            store_path,
            state,
            engine_state: EngineState::Stopped,
            matcher: Arc::new(RwLock::new(matcher)),
            detector,
            route_manager,
            runner,
            wg,
            system_dns,
            dns_proxy: None,
            sni_proxy: None,
            sink,
            tasks: Vec::new(),
        })
    }

    /// Replace the default logging event handler
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.sink.handler = handler;
        self
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sink.tx.subscribe()
    }

    /// Current lifecycle state
    pub fn state(&self) -> EngineState {
        self.engine_state
    }

    /// Current configuration
    pub fn config(&self) -> &Config {
        &self.state.config
    }

    /// Aggregate counters
    pub async fn stats(&self) -> EngineStats {
        EngineStats {
            rules: self.matcher.read().await.len(),
            dns: self
                .dns_proxy
                .as_ref()
                .map(DnsProxy::stats)
                .unwrap_or_default(),
            detector: self.detector.lock().await.stats(),
            routes: self.route_manager.lock().await.stats(),
        }
    }

    /// Advisory probe for usable tunnels
    pub async fn detect_tunnels(&self) -> TunnelStatus {
        detect_tunnels(self.runner.as_ref()).await
    }

    /// Current rule set
    pub async fn rules(&self) -> Vec<Rule> {
        self.matcher.read().await.rules()
    }

    /// Add or replace a rule and persist the set.
    pub async fn add_rule(&mut self, pattern: &str, tunnel: bool) -> Result<()> {
        self.matcher.write().await.add(pattern, tunnel)?;
        self.persist_rules().await
    }

    /// Remove a rule, shedding any recorded mappings and injected
    /// routes for a literal pattern's name.
    pub async fn remove_rule(&mut self, pattern: &str) -> Result<bool> {
        if !self.matcher.write().await.remove(pattern) {
            return Ok(false);
        }

        if !pattern.trim().starts_with("*.") {
            let changes = self.detector.lock().await.remove_domain(pattern);
            self.emit_conflict_changes(changes).await;

            if let Err(e) = self
                .route_manager
                .lock()
                .await
                .remove_for_domain(pattern)
                .await
            {
                self.sink
                    .emit(EngineEvent::Error {
                        component: "route-manager",
                        message: format!("route removal for {} failed: {}", pattern, e),
                    })
                    .await;
            }
        }

        self.persist_rules().await?;
        Ok(true)
    }

    async fn persist_rules(&mut self) -> Result<()> {
        self.state.config.rules = self.matcher.read().await.rules();
        self.state.save(&self.store_path)
    }

    /// Start the whole core: crash recovery, allowed-ips snapshot,
    /// proxies, system DNS redirection, background ticks.
    pub async fn start(&mut self) -> Result<()> {
        if !matches!(self.engine_state, EngineState::Stopped) {
            return Err(Error::AlreadyRunning);
        }

        let vpn = self.state.config.vpn.clone().ok_or_else(|| {
            Error::Config("missing VPN configuration (vpn.interface, vpn.peer_public_key)".into())
        })?;

        self.set_state(EngineState::Starting).await;

        // A crashed previous run may have left the resolver redirected.
        match self
            .system_dns
            .check_for_stale_config(self.state.dns_backup.as_ref())
            .await
        {
            Ok(true) => {
                self.state.dns_backup = None;
                self.state.save(&self.store_path)?;
            }
            Ok(false) => {}
            Err(e) => {
                self.set_state(EngineState::Stopped).await;
                return Err(e.into());
            }
        }

        self.wg
            .set_config(WgTarget {
                interface: vpn.interface,
                peer_public_key: vpn.peer_public_key,
            })
            .await;

        let route_start_result = self.route_manager.lock().await.start().await;
        if let Err(e) = route_start_result {
            self.set_state(EngineState::Stopped).await;
            return Err(e);
        }

        let (dns_events_tx, dns_events_rx) = mpsc::channel::<DnsEvent>(1024);
        let (route_tx, route_rx) = mpsc::channel::<RouteRequest>(1024);
        let (sni_events_tx, sni_events_rx) = mpsc::channel::<SniEvent>(256);

        let dns_config = DnsProxyConfig {
            listen: SocketAddr::new(
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                self.state.config.dns.listen_port,
            ),
            tunnel_upstream: self.state.config.dns.tunnel_upstream.socket_addr()?,
            direct_upstream: self.state.config.dns.direct_upstream.socket_addr()?,
            upstream_timeout: sift_dns::DEFAULT_UPSTREAM_TIMEOUT,
            filter_aaaa: self.state.config.dns.filter_aaaa,
        };
        let mut dns_proxy = DnsProxy::new(
            dns_config,
            self.matcher.clone(),
            self.detector.clone(),
            dns_events_tx,
            route_tx,
        );
        if let Err(e) = dns_proxy.start().await {
            self.abort_start().await;
            return Err(e.into());
        }

        let vpn_socks = match &self.state.config.sni.vpn_socks {
            Some(upstream) => Some(upstream.socket_addr()?),
            None => None,
        };
        let sni_config = SniProxyConfig {
            listen: SocketAddr::new(
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                self.state.config.sni.listen_port,
            ),
            vpn_socks,
            ..Default::default()
        };
        let mut sni_proxy =
            SniProxy::new(sni_config, self.matcher.clone()).with_events(sni_events_tx);
        if let Err(e) = sni_proxy.start().await {
            dns_proxy.stop().await;
            self.abort_start().await;
            return Err(e.into());
        }

        // Redirect last, so the proxy is already serving when port 53
        // traffic starts arriving.
        match self.system_dns.configure().await {
            Ok(backup) => {
                self.state.dns_backup = Some(backup);
                self.state.touch();
                self.state.save(&self.store_path)?;
            }
            Err(e) => {
                sni_proxy.stop().await;
                dns_proxy.stop().await;
                self.abort_start().await;
                return Err(e.into());
            }
        }

        self.spawn_forwarders(dns_events_rx, sni_events_rx, route_rx);
        self.spawn_ticks();

        self.dns_proxy = Some(dns_proxy);
        self.sni_proxy = Some(sni_proxy);
        self.set_state(EngineState::Running).await;
        Ok(())
    }

    /// Stop everything, restore the resolver, remove injected routes.
    ///
    /// All steps run even when one fails; the first error is surfaced.
    pub async fn stop(&mut self) -> Result<()> {
        if matches!(self.engine_state, EngineState::Stopped) {
            return Err(Error::NotRunning);
        }
        self.set_state(EngineState::Stopping).await;

        let restore_result = self.system_dns.restore().await;
        if restore_result.is_ok() {
            self.state.dns_backup = None;
        }

        if let Some(mut proxy) = self.sni_proxy.take() {
            proxy.stop().await;
        }
        if let Some(mut proxy) = self.dns_proxy.take() {
            proxy.stop().await;
        }

        for task in self.tasks.drain(..) {
            task.abort();
        }

        let routes_result = self.route_manager.lock().await.stop().await;
        self.detector.lock().await.clear();

        self.state.touch();
        let save_result = self.state.save(&self.store_path);

        self.set_state(EngineState::Stopped).await;

        restore_result?;
        routes_result?;
        save_result
    }

    /// Best-effort unwind of a partial start
    async fn abort_start(&mut self) {
        let _ = self.route_manager.lock().await.stop().await;
        self.set_state(EngineState::Stopped).await;
    }

    async fn set_state(&mut self, new: EngineState) {
        let old = self.engine_state;
        if old == new {
            return;
        }
        self.engine_state = new;
        self.sink
            .emit(EngineEvent::StateChanged { old, new })
            .await;
    }

    async fn emit_conflict_changes(&self, changes: Vec<ConflictChange>) {
        for change in changes {
            let event = match change {
                ConflictChange::Detected(conflict) => EngineEvent::ConflictDetected(conflict),
                ConflictChange::Resolved(ip) => EngineEvent::ConflictResolved { ip },
            };
            self.sink.emit(event).await;
        }
    }

    fn spawn_forwarders(
        &mut self,
        mut dns_events_rx: mpsc::Receiver<DnsEvent>,
        mut sni_events_rx: mpsc::Receiver<SniEvent>,
        mut route_rx: mpsc::Receiver<RouteRequest>,
    ) {
        let sink = self.sink.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(event) = dns_events_rx.recv().await {
                let mapped = match event {
                    DnsEvent::Query {
                        client,
                        name,
                        qtype,
                        tunnel,
                        matched_rule,
                        ..
                    } => EngineEvent::Query {
                        client,
                        name,
                        qtype: qtype.to_string(),
                        tunnel,
                        matched_rule,
                    },
                    DnsEvent::Response {
                        name, ips, min_ttl, ..
                    } => EngineEvent::Response { name, ips, min_ttl },
                    DnsEvent::RouteInjection {
                        domain,
                        ips,
                        tunnel,
                        conflict,
                    } => EngineEvent::RouteInjection {
                        domain,
                        ips,
                        tunnel,
                        conflict,
                    },
                    DnsEvent::Conflict(ConflictChange::Detected(conflict)) => {
                        EngineEvent::ConflictDetected(conflict)
                    }
                    DnsEvent::Conflict(ConflictChange::Resolved(ip)) => {
                        EngineEvent::ConflictResolved { ip }
                    }
                    DnsEvent::Error { message, .. } => EngineEvent::Error {
                        component: "dns-proxy",
                        message,
                    },
                };
                sink.emit(mapped).await;
            }
        }));

        let sink = self.sink.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(event) = sni_events_rx.recv().await {
                let mapped = match event {
                    SniEvent::ConnectionOpened {
                        target,
                        port,
                        tunnel,
                        ..
                    } => EngineEvent::SniConnection {
                        target,
                        port,
                        tunnel,
                    },
                    SniEvent::ConnectionFailed { message, .. } => EngineEvent::Error {
                        component: "sni-proxy",
                        message,
                    },
                };
                sink.emit(mapped).await;
            }
        }));

        // Injection requests from the DNS response path, serialized
        // through the route manager's lock.
        let route_manager = self.route_manager.clone();
        let sink = self.sink.clone();
        let ttl = self.state.config.routes.ttl();
        self.tasks.push(tokio::spawn(async move {
            while let Some(request) = route_rx.recv().await {
                let result = route_manager
                    .lock()
                    .await
                    .inject(&request.domain, &request.ips, ttl)
                    .await;
                if let Err(e) = result {
                    sink.emit(EngineEvent::Error {
                        component: "route-manager",
                        message: format!("injection for {} failed: {}", request.domain, e),
                    })
                    .await;
                }
            }
        }));
    }

    fn spawn_ticks(&mut self) {
        let route_manager = self.route_manager.clone();
        let sink = self.sink.clone();
        let period = self.state.config.routes.cleanup_interval();
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = route_manager.lock().await.cleanup_expired().await {
                    sink.emit(EngineEvent::Error {
                        component: "route-manager",
                        message: format!("cleanup tick failed: {}", e),
                    })
                    .await;
                }
            }
        }));

        let detector = self.detector.clone();
        let sink = self.sink.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = interval(DETECTOR_CLEANUP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let changes = detector.lock().await.cleanup();
                for change in changes {
                    let event = match change {
                        ConflictChange::Detected(conflict) => {
                            EngineEvent::ConflictDetected(conflict)
                        }
                        ConflictChange::Resolved(ip) => EngineEvent::ConflictResolved { ip },
                    };
                    sink.emit(event).await;
                }
            }
        }));
    }
}
