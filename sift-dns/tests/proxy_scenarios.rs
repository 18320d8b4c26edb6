//! Socket-level DNS proxy scenarios against mock upstreams

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use std::str::FromStr;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex, RwLock};

use sift_dns::{DnsEvent, DnsProxy, DnsProxyConfig, RouteRequest};
use sift_rules::{ConflictDetector, DomainMatcher};

/// Mock upstream answering every A query with the given addresses.
/// Returns the bound address and a hit counter.
async fn spawn_upstream(answers: Vec<Ipv4Addr>) -> (SocketAddr, Arc<AtomicUsize>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let counter = hits.clone();
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        while let Ok((len, src)) = socket.recv_from(&mut buf).await {
            counter.fetch_add(1, Ordering::SeqCst);

            let query = match Message::from_vec(&buf[..len]) {
                Ok(q) => q,
                Err(_) => continue,
            };
            let mut response = Message::new();
            response.set_id(query.id());
            response.set_message_type(MessageType::Response);
            for q in query.queries() {
                response.add_query(q.clone());
            }
            if let Some(q) = query.queries().first() {
                for ip in &answers {
                    response.add_answer(Record::from_rdata(
                        q.name().clone(),
                        60,
                        RData::A(A(*ip)),
                    ));
                }
            }
            let _ = socket.send_to(&response.to_vec().unwrap(), src).await;
        }
    });

    (addr, hits)
}

fn a_query(name: &str, id: u16) -> Vec<u8> {
    let mut message = Message::new();
    message.set_id(id);
    message.set_recursion_desired(true);
    message.add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
    message.to_vec().unwrap()
}

async fn ask(proxy: SocketAddr, query: &[u8]) -> Vec<u8> {
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(query, proxy).await.unwrap();
    let mut buf = vec![0u8; 4096];
    let len = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf))
        .await
        .expect("proxy did not answer")
        .unwrap();
    buf.truncate(len);
    buf
}

struct Harness {
    proxy: DnsProxy,
    addr: SocketAddr,
    events: mpsc::Receiver<DnsEvent>,
    routes: mpsc::Receiver<RouteRequest>,
    detector: Arc<Mutex<ConflictDetector>>,
}

async fn start_proxy(
    rules: &[(&str, bool)],
    tunnel_upstream: SocketAddr,
    direct_upstream: SocketAddr,
    upstream_timeout: Duration,
) -> Harness {
    let mut matcher = DomainMatcher::new();
    for (pattern, tunnel) in rules {
        matcher.add(pattern, *tunnel).unwrap();
    }

    let detector = Arc::new(Mutex::new(ConflictDetector::new()));
    let (events_tx, events) = mpsc::channel(256);
    let (routes_tx, routes) = mpsc::channel(256);

    let mut proxy = DnsProxy::new(
        DnsProxyConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            tunnel_upstream,
            direct_upstream,
            upstream_timeout,
            filter_aaaa: false,
        },
        Arc::new(RwLock::new(matcher)),
        detector.clone(),
        events_tx,
        routes_tx,
    );
    proxy.start().await.unwrap();
    let addr = proxy.local_addr().unwrap();

    Harness {
        proxy,
        addr,
        events,
        routes,
        detector,
    }
}

#[tokio::test]
async fn simple_tunnel_injects_route() {
    let ip = Ipv4Addr::new(93, 184, 216, 34);
    let (tunnel, tunnel_hits) = spawn_upstream(vec![ip]).await;
    let (direct, direct_hits) = spawn_upstream(vec![Ipv4Addr::new(9, 9, 9, 9)]).await;

    let mut h = start_proxy(
        &[("example.com", true)],
        tunnel,
        direct,
        Duration::from_secs(2),
    )
    .await;

    let reply = ask(h.addr, &a_query("example.com.", 0x1234)).await;
    let decoded = Message::from_vec(&reply).unwrap();
    assert_eq!(decoded.id(), 0x1234);
    assert_eq!(decoded.answers().len(), 1);

    assert_eq!(tunnel_hits.load(Ordering::SeqCst), 1);
    assert_eq!(direct_hits.load(Ordering::SeqCst), 0);

    let request = h.routes.recv().await.unwrap();
    assert_eq!(request.domain, "example.com");
    assert_eq!(request.ips, vec![ip]);
    assert_eq!(request.answer_ttl, 60);

    // query -> response -> route-injection, in order
    assert!(matches!(
        h.events.recv().await.unwrap(),
        DnsEvent::Query { tunnel: true, .. }
    ));
    assert!(matches!(h.events.recv().await.unwrap(), DnsEvent::Response { .. }));
    assert!(matches!(
        h.events.recv().await.unwrap(),
        DnsEvent::RouteInjection { conflict: None, .. }
    ));

    let stats = h.proxy.stats();
    assert_eq!(stats.queries_tunnel, 1);
    assert_eq!(stats.queries_direct, 0);
    assert_eq!(stats.responses, 1);
    assert_eq!(stats.servfails, 0);

    h.proxy.stop().await;
}

#[tokio::test]
async fn wildcard_does_not_match_base() {
    let (tunnel, tunnel_hits) = spawn_upstream(vec![Ipv4Addr::new(192, 0, 2, 1)]).await;
    let (direct, direct_hits) = spawn_upstream(vec![Ipv4Addr::new(192, 0, 2, 2)]).await;

    let mut h = start_proxy(
        &[("*.example.com", true)],
        tunnel,
        direct,
        Duration::from_secs(2),
    )
    .await;

    ask(h.addr, &a_query("example.com.", 1)).await;
    assert_eq!(direct_hits.load(Ordering::SeqCst), 1);
    assert_eq!(tunnel_hits.load(Ordering::SeqCst), 0);

    ask(h.addr, &a_query("api.example.com.", 2)).await;
    assert_eq!(tunnel_hits.load(Ordering::SeqCst), 1);

    // Only the subdomain produced an injection request.
    let request = h.routes.recv().await.unwrap();
    assert_eq!(request.domain, "api.example.com");
    assert!(h.routes.try_recv().is_err());

    h.proxy.stop().await;
}

#[tokio::test]
async fn upstream_timeout_yields_servfail() {
    // Bound but silent.
    let blackhole = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let blackhole_addr = blackhole.local_addr().unwrap();
    let (direct, _) = spawn_upstream(vec![]).await;

    let mut h = start_proxy(
        &[("slow.test", true)],
        blackhole_addr,
        direct,
        Duration::from_millis(100),
    )
    .await;

    let reply = ask(h.addr, &a_query("slow.test.", 0xbeef)).await;
    let decoded = Message::from_vec(&reply).unwrap();
    assert_eq!(decoded.id(), 0xbeef);
    assert_eq!(decoded.response_code(), ResponseCode::ServFail);
    assert_eq!(decoded.queries().len(), 1);
    assert_eq!(decoded.queries()[0].name().to_string(), "slow.test.");
    assert!(decoded.answers().is_empty());

    let stats = h.proxy.stats();
    assert_eq!(stats.servfails, 1);
    assert_eq!(stats.queries_tunnel, 1);
    assert_eq!(stats.responses, 0);

    h.proxy.stop().await;
}

#[tokio::test]
async fn shared_ip_produces_conflict() {
    let shared = Ipv4Addr::new(198, 51, 100, 7);
    let (tunnel, _) = spawn_upstream(vec![shared]).await;
    let (direct, _) = spawn_upstream(vec![shared]).await;

    let mut h = start_proxy(
        &[("a.test", true), ("b.test", false)],
        tunnel,
        direct,
        Duration::from_secs(2),
    )
    .await;

    ask(h.addr, &a_query("a.test.", 1)).await;
    ask(h.addr, &a_query("b.test.", 2)).await;

    assert!(h.detector.lock().await.has_conflict(shared));

    // The b.test injection event reports the conflict.
    let mut saw_conflict = false;
    while let Ok(event) = h.events.try_recv() {
        if let DnsEvent::RouteInjection {
            domain, conflict, ..
        } = event
        {
            if domain == "b.test" {
                saw_conflict = conflict.is_some();
            }
        }
    }
    assert!(saw_conflict);

    h.proxy.stop().await;
}
