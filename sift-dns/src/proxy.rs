//! UDP DNS proxy server
//!
//! Listens on the loopback, classifies each query through the rule
//! set, and forwards it verbatim to the tunnel or direct upstream.
//! Resolved IPv4 addresses are recorded in the conflict detector and
//! offered to the route injector over an mpsc channel; per-query
//! outcomes are reported over a typed event channel.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};

use sift_rules::{Conflict, ConflictChange, ConflictDetector, DomainMatcher};

use crate::answer::{extract_answer, filter_aaaa, synthesize_servfail};
use crate::error::{Error, Result};
use crate::upstream::exchange;

/// Maximum DNS message size for UDP
const MAX_DNS_MESSAGE_SIZE: usize = 4096;

/// Default upstream exchange timeout
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// DNS proxy configuration
#[derive(Debug, Clone)]
pub struct DnsProxyConfig {
    /// Listen address, normally a loopback port
    pub listen: SocketAddr,
    /// Upstream for tunnel-classified names
    pub tunnel_upstream: SocketAddr,
    /// Upstream for direct-classified names
    pub direct_upstream: SocketAddr,
    /// Per-query upstream timeout
    pub upstream_timeout: Duration,
    /// Strip AAAA records from forwarded responses
    pub filter_aaaa: bool,
}

impl Default for DnsProxyConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:5353".parse().unwrap(),
            tunnel_upstream: "8.8.8.8:53".parse().unwrap(),
            direct_upstream: "1.1.1.1:53".parse().unwrap(),
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
            filter_aaaa: false,
        }
    }
}

/// Per-query events emitted by the proxy.
///
/// For a single query id the order is `Query` then `Response` or
/// `Error`, then optionally `RouteInjection`. No ordering holds across
/// queries.
#[derive(Debug, Clone)]
pub enum DnsEvent {
    /// A query arrived and was classified
    Query {
        client: SocketAddr,
        id: u16,
        name: String,
        qtype: RecordType,
        tunnel: bool,
        matched_rule: Option<String>,
    },

    /// An upstream response was relayed to the client
    Response {
        client: SocketAddr,
        id: u16,
        name: String,
        ips: Vec<Ipv4Addr>,
        min_ttl: u32,
    },

    /// Resolved addresses were recorded for routing
    RouteInjection {
        domain: String,
        ips: Vec<Ipv4Addr>,
        tunnel: bool,
        /// First conflict among the recorded addresses, if any
        conflict: Option<Conflict>,
    },

    /// Recording flipped an ip into or out of the conflicting state
    Conflict(ConflictChange),

    /// A locally recovered error (decode failure, upstream failure,
    /// client send failure)
    Error {
        client: Option<SocketAddr>,
        message: String,
    },
}

/// Injection request handed to the route manager task
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub domain: String,
    pub ips: Vec<Ipv4Addr>,
    /// Minimum TTL extracted from the answer; route TTL policy is the
    /// receiver's decision
    pub answer_ttl: u32,
}

/// Proxy counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsStats {
    /// Queries classified as tunnel
    pub queries_tunnel: u64,
    /// Queries classified as direct
    pub queries_direct: u64,
    /// Upstream responses relayed to clients
    pub responses: u64,
    /// SERVFAIL responses synthesized for failed upstreams
    pub servfails: u64,
}

/// Atomic counters shared with per-query tasks (lock-free access)
#[derive(Default)]
struct SharedStats {
    queries_tunnel: AtomicU64,
    queries_direct: AtomicU64,
    responses: AtomicU64,
    servfails: AtomicU64,
}

impl SharedStats {
    fn record_query(&self, tunnel: bool) {
        if tunnel {
            self.queries_tunnel.fetch_add(1, Ordering::Relaxed);
        } else {
            self.queries_direct.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_response(&self) {
        self.responses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_servfail(&self) {
        self.servfails.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DnsStats {
        DnsStats {
            queries_tunnel: self.queries_tunnel.load(Ordering::Relaxed),
            queries_direct: self.queries_direct.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            servfails: self.servfails.load(Ordering::Relaxed),
        }
    }
}

enum ProxyState {
    Stopped,
    Running,
}

/// Everything a per-query task needs
struct ProxyContext {
    config: DnsProxyConfig,
    matcher: Arc<RwLock<DomainMatcher>>,
    detector: Arc<Mutex<ConflictDetector>>,
    events: mpsc::Sender<DnsEvent>,
    routes: mpsc::Sender<RouteRequest>,
    stats: SharedStats,
}

/// Classifying DNS proxy server
pub struct DnsProxy {
    context: Arc<ProxyContext>,
    state: ProxyState,
    shutdown_tx: Option<broadcast::Sender<()>>,
    task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl DnsProxy {
    /// Create a proxy over shared rule and conflict state.
    ///
    /// Events and route requests are delivered on the given channels;
    /// a dropped receiver only disables that reporting path.
    pub fn new(
        config: DnsProxyConfig,
        matcher: Arc<RwLock<DomainMatcher>>,
        detector: Arc<Mutex<ConflictDetector>>,
        events: mpsc::Sender<DnsEvent>,
        routes: mpsc::Sender<RouteRequest>,
    ) -> Self {
        Self {
            context: Arc::new(ProxyContext {
                config,
                matcher,
                detector,
                events,
                routes,
                stats: SharedStats::default(),
            }),
            state: ProxyState::Stopped,
            shutdown_tx: None,
            task: None,
            local_addr: None,
        }
    }

    /// Bind the socket and start serving.
    ///
    /// Fails with [`Error::AlreadyRunning`] on a second start and with
    /// [`Error::Bind`] when the socket cannot be bound.
    pub async fn start(&mut self) -> Result<()> {
        if matches!(self.state, ProxyState::Running) {
            return Err(Error::AlreadyRunning);
        }

        let listen = self.context.config.listen;
        let socket = UdpSocket::bind(listen).await.map_err(|e| Error::Bind {
            addr: listen,
            source: e,
        })?;
        let local_addr = socket.local_addr()?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let context = self.context.clone();
        let task = tokio::spawn(run_loop(Arc::new(socket), context, shutdown_rx));

        self.local_addr = Some(local_addr);
        self.shutdown_tx = Some(shutdown_tx);
        self.task = Some(task);
        self.state = ProxyState::Running;

        log::info!("DNS proxy listening on {}", local_addr);
        Ok(())
    }

    /// Stop serving. Pending queries are dropped; in-flight upstream
    /// exchanges are not awaited.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.state = ProxyState::Stopped;
        self.local_addr = None;
        log::info!("DNS proxy stopped");
    }

    /// Whether the proxy is currently serving
    pub fn is_running(&self) -> bool {
        matches!(self.state, ProxyState::Running)
    }

    /// Actual bound address while running (useful with port 0)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Counters accumulated since the proxy was created
    pub fn stats(&self) -> DnsStats {
        self.context.stats.snapshot()
    }
}

async fn run_loop(
    socket: Arc<UdpSocket>,
    context: Arc<ProxyContext>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; MAX_DNS_MESSAGE_SIZE];
    let mut queries = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                queries.abort_all();
                break;
            }

            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, client)) => {
                        let datagram = buf[..len].to_vec();
                        let socket = socket.clone();
                        let context = context.clone();
                        queries.spawn(async move {
                            handle_query(&socket, &context, datagram, client).await;
                        });
                    }
                    Err(e) => {
                        log::error!("DNS proxy recv error: {}", e);
                    }
                }

                // Reap finished query tasks without blocking the loop.
                while queries.try_join_next().is_some() {}
            }
        }
    }
}

/// One linear task per query: classify, forward, record, reply.
async fn handle_query(
    socket: &UdpSocket,
    context: &ProxyContext,
    datagram: Vec<u8>,
    client: SocketAddr,
) {
    let message = match Message::from_vec(&datagram) {
        Ok(m) => m,
        Err(e) => {
            let _ = context
                .events
                .send(DnsEvent::Error {
                    client: Some(client),
                    message: format!("failed to decode DNS query: {}", e),
                })
                .await;
            return;
        }
    };

    let Some(question) = message.queries().first() else {
        // Nothing to answer; ignore.
        return;
    };

    let id = message.id();
    let name = sift_rules::normalize_name(&question.name().to_string());
    let qtype = question.query_type();

    let decision = context.matcher.read().await.classify(&name);
    context.stats.record_query(decision.tunnel);
    let _ = context
        .events
        .send(DnsEvent::Query {
            client,
            id,
            name: name.clone(),
            qtype,
            tunnel: decision.tunnel,
            matched_rule: decision.matched_rule.clone(),
        })
        .await;

    let upstream = if decision.tunnel {
        context.config.tunnel_upstream
    } else {
        context.config.direct_upstream
    };

    let response = match exchange(upstream, &datagram, context.config.upstream_timeout).await {
        Ok(bytes) => bytes,
        Err(e) => {
            let _ = context
                .events
                .send(DnsEvent::Error {
                    client: Some(client),
                    message: format!("upstream failed for {}: {}", name, e),
                })
                .await;

            match synthesize_servfail(&datagram) {
                Ok(servfail) => {
                    context.stats.record_servfail();
                    if let Err(e) = socket.send_to(&servfail, client).await {
                        log::debug!("failed to send SERVFAIL to {}: {}", client, e);
                    }
                }
                Err(e) => log::debug!("could not synthesize SERVFAIL: {}", e),
            }
            return;
        }
    };

    if let Some(answer) = extract_answer(&response) {
        let _ = context
            .events
            .send(DnsEvent::Response {
                client,
                id,
                name: name.clone(),
                ips: answer.ips.clone(),
                min_ttl: answer.min_ttl,
            })
            .await;

        if !answer.ips.is_empty() {
            let (changes, conflict) = {
                let mut detector = context.detector.lock().await;
                let changes = detector.record_batch(&name, &answer.ips, decision.tunnel);
                let conflict = answer
                    .ips
                    .iter()
                    .find_map(|ip| detector.conflict_for(*ip).cloned());
                (changes, conflict)
            };

            for change in changes {
                let _ = context.events.send(DnsEvent::Conflict(change)).await;
            }

            let _ = context
                .events
                .send(DnsEvent::RouteInjection {
                    domain: name.clone(),
                    ips: answer.ips.clone(),
                    tunnel: decision.tunnel,
                    conflict,
                })
                .await;

            if decision.tunnel {
                let request = RouteRequest {
                    domain: name.clone(),
                    ips: answer.ips.clone(),
                    answer_ttl: answer.min_ttl,
                };
                if let Err(e) = context.routes.try_send(request) {
                    log::debug!("route request channel rejected {}: {}", name, e);
                }
            }
        }
    }

    let reply = if context.config.filter_aaaa {
        match filter_aaaa(&response) {
            Ok(filtered) => filtered,
            Err(e) => {
                log::debug!("AAAA filter failed for {}: {}", name, e);
                response
            }
        }
    } else {
        response
    };

    context.stats.record_response();
    if let Err(e) = socket.send_to(&reply, client).await {
        let _ = context
            .events
            .send(DnsEvent::Error {
                client: Some(client),
                message: format!("failed to send response to client: {}", e),
            })
            .await;
    }
}
