//! SOCKS5 server with rule-based egress selection
//!
//! Per connection: SOCKS5 greeting and CONNECT request, classify the
//! target host through the rule set, dial directly or through the
//! VPN-side SOCKS, then splice bytes until either side closes.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::{JoinHandle, JoinSet};

use sift_rules::DomainMatcher;

use crate::error::{Error, Result};
use crate::upstream::socks_connect;

const SOCKS_VERSION: u8 = 0x05;
const AUTH_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ADDR_IPV4: u8 = 0x01;
const ADDR_DOMAIN: u8 = 0x03;
const ADDR_IPV6: u8 = 0x04;
const REPLY_SUCCESS: u8 = 0x00;
const REPLY_GENERAL_FAILURE: u8 = 0x01;

/// Relay buffer size per direction
const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// SNI proxy configuration
#[derive(Debug, Clone)]
pub struct SniProxyConfig {
    /// Listen address, normally a loopback port
    pub listen: SocketAddr,
    /// VPN-side SOCKS endpoint for tunnel-classified targets.
    /// Tunnel targets are dialed directly when unset.
    pub vpn_socks: Option<SocketAddr>,
    /// Per-read deadline during greeting/request
    pub handshake_timeout: Duration,
    /// Outbound dial deadline
    pub dial_timeout: Duration,
}

impl Default for SniProxyConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:1080".parse().unwrap(),
            vpn_socks: None,
            handshake_timeout: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(10),
        }
    }
}

/// Per-connection outcomes reported by the proxy
#[derive(Debug, Clone)]
pub enum SniEvent {
    /// A CONNECT was classified and dialed
    ConnectionOpened {
        client: SocketAddr,
        target: String,
        port: u16,
        tunnel: bool,
    },
    /// A connection failed before or during relay
    ConnectionFailed {
        client: SocketAddr,
        target: Option<String>,
        message: String,
    },
}

/// Parsed CONNECT target
#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

impl Target {
    fn host(&self) -> String {
        match self {
            Target::Ipv4(ip) => ip.to_string(),
            Target::Ipv6(ip) => ip.to_string(),
            Target::Domain(name) => name.clone(),
        }
    }
}

enum ServerState {
    Stopped,
    Running,
}

/// SOCKS5 server selecting an egress per connection
pub struct SniProxy {
    config: SniProxyConfig,
    matcher: Arc<RwLock<DomainMatcher>>,
    events: Option<mpsc::Sender<SniEvent>>,
    active: Arc<AtomicU64>,
    state: ServerState,
    shutdown_tx: Option<broadcast::Sender<()>>,
    task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl SniProxy {
    /// Create a proxy over the shared rule set
    pub fn new(config: SniProxyConfig, matcher: Arc<RwLock<DomainMatcher>>) -> Self {
        Self {
            config,
            matcher,
            events: None,
            active: Arc::new(AtomicU64::new(0)),
            state: ServerState::Stopped,
            shutdown_tx: None,
            task: None,
            local_addr: None,
        }
    }

    /// Report per-connection outcomes on the given channel
    pub fn with_events(mut self, events: mpsc::Sender<SniEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Bind the listener and start accepting
    pub async fn start(&mut self) -> Result<()> {
        if matches!(self.state, ServerState::Running) {
            return Err(Error::AlreadyRunning);
        }

        let listen = self.config.listen;
        let listener = TcpListener::bind(listen).await.map_err(|e| Error::Bind {
            addr: listen,
            source: e,
        })?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(accept_loop(
            listener,
            self.config.clone(),
            self.matcher.clone(),
            self.events.clone(),
            self.active.clone(),
            shutdown_rx,
        ));

        self.local_addr = Some(local_addr);
        self.shutdown_tx = Some(shutdown_tx);
        self.task = Some(task);
        self.state = ServerState::Running;

        log::info!("SNI proxy listening on {}", local_addr);
        Ok(())
    }

    /// Close the listener and force-close every active connection
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.state = ServerState::Stopped;
        self.local_addr = None;
        log::info!("SNI proxy stopped");
    }

    /// Whether the proxy is currently accepting
    pub fn is_running(&self) -> bool {
        matches!(self.state, ServerState::Running)
    }

    /// Actual bound address while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of connections currently being relayed
    pub fn active_connections(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: SniProxyConfig,
    matcher: Arc<RwLock<DomainMatcher>>,
    events: Option<mpsc::Sender<SniEvent>>,
    active: Arc<AtomicU64>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                connections.abort_all();
                break;
            }

            result = listener.accept() => {
                match result {
                    Ok((stream, client)) => {
                        let config = config.clone();
                        let matcher = matcher.clone();
                        let events = events.clone();
                        let active = active.clone();

                        active.fetch_add(1, Ordering::Relaxed);
                        connections.spawn(async move {
                            if let Err(e) =
                                handle_connection(stream, client, &config, &matcher, events.as_ref())
                                    .await
                            {
                                log::debug!("SOCKS connection from {}: {}", client, e);
                            }
                            active.fetch_sub(1, Ordering::Relaxed);
                        });
                    }
                    Err(e) => {
                        log::warn!("SOCKS accept error: {}", e);
                    }
                }

                while connections.try_join_next().is_some() {}
            }
        }
    }
}

/// greeting -> request -> dialing -> relaying, closed on any error
async fn handle_connection(
    mut stream: TcpStream,
    client: SocketAddr,
    config: &SniProxyConfig,
    matcher: &RwLock<DomainMatcher>,
    events: Option<&mpsc::Sender<SniEvent>>,
) -> Result<()> {
    let result = socks_handshake(&mut stream, config, matcher, client).await;
    match result {
        Ok((remote, target, port, tunnel)) => {
            if let Some(tx) = events {
                let _ = tx
                    .send(SniEvent::ConnectionOpened {
                        client,
                        target: target.clone(),
                        port,
                        tunnel,
                    })
                    .await;
            }
            relay(stream, remote).await;
            Ok(())
        }
        Err(e) => {
            if let Some(tx) = events {
                let _ = tx
                    .send(SniEvent::ConnectionFailed {
                        client,
                        target: None,
                        message: e.to_string(),
                    })
                    .await;
            }
            Err(e)
        }
    }
}

/// Run the SOCKS5 greeting and request, classify, dial.
async fn socks_handshake(
    stream: &mut TcpStream,
    config: &SniProxyConfig,
    matcher: &RwLock<DomainMatcher>,
    client: SocketAddr,
) -> Result<(TcpStream, String, u16, bool)> {
    let deadline = config.handshake_timeout;

    // Greeting: version + methods.
    let mut head = [0u8; 2];
    read_with_deadline(stream, &mut head, deadline).await?;
    if head[0] != SOCKS_VERSION {
        return Err(Error::InvalidVersion(head[0]));
    }
    let mut methods = vec![0u8; head[1] as usize];
    read_with_deadline(stream, &mut methods, deadline).await?;
    stream.write_all(&[SOCKS_VERSION, AUTH_NO_AUTH]).await?;

    // Request header.
    let mut header = [0u8; 4];
    read_with_deadline(stream, &mut header, deadline).await?;
    if header[0] != SOCKS_VERSION {
        return Err(Error::InvalidVersion(header[0]));
    }
    if header[1] != CMD_CONNECT {
        send_reply(stream, REPLY_GENERAL_FAILURE).await?;
        return Err(Error::UnsupportedCommand(header[1]));
    }

    let target = match header[3] {
        ADDR_IPV4 => {
            let mut ip = [0u8; 4];
            read_with_deadline(stream, &mut ip, deadline).await?;
            Target::Ipv4(Ipv4Addr::from(ip))
        }
        ADDR_DOMAIN => {
            let mut len = [0u8; 1];
            read_with_deadline(stream, &mut len, deadline).await?;
            let mut name = vec![0u8; len[0] as usize];
            read_with_deadline(stream, &mut name, deadline).await?;
            match String::from_utf8(name) {
                Ok(name) => Target::Domain(name),
                Err(_) => {
                    send_reply(stream, REPLY_GENERAL_FAILURE).await?;
                    return Err(Error::InvalidAddressType(ADDR_DOMAIN));
                }
            }
        }
        ADDR_IPV6 => {
            let mut ip = [0u8; 16];
            read_with_deadline(stream, &mut ip, deadline).await?;
            Target::Ipv6(Ipv6Addr::from(ip))
        }
        other => {
            send_reply(stream, REPLY_GENERAL_FAILURE).await?;
            return Err(Error::InvalidAddressType(other));
        }
    };
    let mut port = [0u8; 2];
    read_with_deadline(stream, &mut port, deadline).await?;
    let port = u16::from_be_bytes(port);

    let host = target.host();
    let tunnel = matcher.read().await.classify(&host).tunnel;
    log::debug!(
        "SOCKS CONNECT {} -> {}:{} ({})",
        client,
        host,
        port,
        if tunnel { "tunnel" } else { "direct" }
    );

    let dialed = match (tunnel, config.vpn_socks) {
        (true, Some(vpn_socks)) => socks_connect(vpn_socks, &host, port, config.dial_timeout).await,
        _ => dial_direct(&target, &host, port, config.dial_timeout).await,
    };

    match dialed {
        Ok(remote) => {
            send_reply(stream, REPLY_SUCCESS).await?;
            Ok((remote, host, port, tunnel))
        }
        Err(e) => {
            send_reply(stream, REPLY_GENERAL_FAILURE).await?;
            Err(e)
        }
    }
}

async fn dial_direct(
    target: &Target,
    host: &str,
    port: u16,
    dial_timeout: Duration,
) -> Result<TcpStream> {
    let connect = async {
        match target {
            Target::Ipv4(ip) => TcpStream::connect((*ip, port)).await,
            Target::Ipv6(ip) => TcpStream::connect((*ip, port)).await,
            Target::Domain(name) => TcpStream::connect((name.as_str(), port)).await,
        }
    };

    tokio::time::timeout(dial_timeout, connect)
        .await
        .map_err(|_| Error::DialFailed {
            target: format!("{}:{}", host, port),
            reason: "connect timed out".into(),
        })?
        .map_err(|e| Error::DialFailed {
            target: format!("{}:{}", host, port),
            reason: e.to_string(),
        })
}

async fn send_reply(stream: &mut TcpStream, reply: u8) -> Result<()> {
    let response = [
        SOCKS_VERSION,
        reply,
        0x00, // reserved
        ADDR_IPV4,
        0, 0, 0, 0, // bind address 0.0.0.0
        0, 0, // bind port 0
    ];
    stream.write_all(&response).await?;
    Ok(())
}

async fn read_with_deadline(
    stream: &mut TcpStream,
    buf: &mut [u8],
    deadline: Duration,
) -> Result<()> {
    tokio::time::timeout(deadline, stream.read_exact(buf))
        .await
        .map_err(|_| Error::HandshakeTimeout)??;
    Ok(())
}

/// Splice bytes in both directions until either side closes.
async fn relay(mut client: TcpStream, mut remote: TcpStream) {
    let (mut client_read, mut client_write) = client.split();
    let (mut remote_read, mut remote_write) = remote.split();

    let upstream = async {
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        loop {
            let n = client_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            remote_write.write_all(&buf[..n]).await?;
        }
        remote_write.shutdown().await
    };

    let downstream = async {
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        loop {
            let n = remote_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            client_write.write_all(&buf[..n]).await?;
        }
        client_write.shutdown().await
    };

    let _ = tokio::join!(upstream, downstream);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_stop() {
        let mut proxy = SniProxy::new(
            SniProxyConfig {
                listen: "127.0.0.1:0".parse().unwrap(),
                ..Default::default()
            },
            Arc::new(RwLock::new(DomainMatcher::new())),
        );

        proxy.start().await.unwrap();
        assert!(proxy.is_running());
        assert!(matches!(proxy.start().await, Err(Error::AlreadyRunning)));
        proxy.stop().await;
        assert!(!proxy.is_running());
        assert_eq!(proxy.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_non_socks_client_dropped() {
        let mut proxy = SniProxy::new(
            SniProxyConfig {
                listen: "127.0.0.1:0".parse().unwrap(),
                ..Default::default()
            },
            Arc::new(RwLock::new(DomainMatcher::new())),
        );
        proxy.start().await.unwrap();
        let addr = proxy.local_addr().unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&[0x04, 0x01]).await.unwrap();

        // The proxy closes without replying.
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        proxy.stop().await;
    }
}
