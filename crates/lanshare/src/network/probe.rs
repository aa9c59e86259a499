//! Local and remote TCP port probing.
//!
//! Used to validate a port choice before the share server binds it, to scan
//! a host for listening services, and to work out which local address other
//! machines on the LAN should use to reach us.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, UdpSocket};
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

/// Connect timeout used per port when scanning.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_millis(100);

/// Connects kept in flight at once when scanning.
pub const DEFAULT_SCAN_CONCURRENCY: usize = 64;

/// Public address used to pick the outbound interface. Nothing is sent to it.
const ROUTE_PROBE_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 80);

/// Returned by [`local_address`] when no route exists.
pub const LOOPBACK_ADDRESS: &str = "127.0.0.1";

/// Returns true iff `port` can be bound on the wildcard address right now.
///
/// The listener is released before returning. A port already in use, a
/// privileged port without permission, or port 0 all report `false`.
pub fn is_port_free(port: u16) -> bool {
    if port == 0 {
        return false;
    }

    match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)) {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(e) => {
            debug!("Port {} is not free: {}", port, e);
            false
        }
    }
}

/// Returns the outbound-facing local address, or `"127.0.0.1"` without a route.
///
/// Best effort: a UDP socket is "connected" toward a public address so the OS
/// picks the interface, then the local endpoint is read back.
pub fn local_address() -> String {
    match local_address_toward(ROUTE_PROBE_ADDR) {
        Some(ip) => ip.to_string(),
        None => LOOPBACK_ADDRESS.to_string(),
    }
}

/// Returns the local address the OS would use to reach `target`.
pub fn local_address_toward(target: SocketAddr) -> Option<IpAddr> {
    let bind_addr: SocketAddr = match target {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
    };

    let socket = match UdpSocket::bind(bind_addr) {
        Ok(socket) => socket,
        Err(e) => {
            warn!("Failed to open UDP socket for route lookup: {}", e);
            return None;
        }
    };

    if let Err(e) = socket.connect(target) {
        debug!("No route toward {}: {}", target, e);
        return None;
    }

    match socket.local_addr() {
        Ok(addr) if !addr.ip().is_unspecified() => Some(addr.ip()),
        Ok(_) => None,
        Err(e) => {
            warn!("Failed to read local endpoint: {}", e);
            None
        }
    }
}

/// TCP connect scanner.
///
/// Connects run concurrently up to `concurrency`, but results always come
/// back in ascending port order.
#[derive(Debug, Clone)]
pub struct PortScanner {
    timeout: Duration,
    concurrency: usize,
}

impl Default for PortScanner {
    fn default() -> Self {
        Self::new(DEFAULT_SCAN_TIMEOUT)
    }
}

impl PortScanner {
    /// Create a scanner with the given per-port connect timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            concurrency: DEFAULT_SCAN_CONCURRENCY,
        }
    }

    /// Set how many connects may be in flight at once (minimum 1).
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Returns the open ports of `host` in `start_port..=end_port`, ascending.
    ///
    /// An inverted range or an unresolvable host yields an empty list. Worst
    /// case wall time is roughly `ports / concurrency * timeout`.
    pub async fn scan(&self, host: &str, start_port: u16, end_port: u16) -> Vec<u16> {
        if start_port > end_port {
            debug!("Empty scan range {}..={}", start_port, end_port);
            return Vec::new();
        }

        let ip = match resolve_host(host).await {
            Some(ip) => ip,
            None => {
                warn!("Could not resolve scan target {:?}", host);
                return Vec::new();
            }
        };

        debug!(
            "Scanning {} ({}) ports {}..={}",
            host, ip, start_port, end_port
        );

        let timeout = self.timeout;
        let open: Vec<u16> = stream::iter(start_port..=end_port)
            .map(|port| async move {
                let addr = SocketAddr::new(ip, port);
                match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
                    Ok(Ok(_stream)) => {
                        trace!("Port {} open", port);
                        Some(port)
                    }
                    _ => None,
                }
            })
            .buffered(self.concurrency)
            .filter_map(|port| async move { port })
            .collect()
            .await;

        debug!("Scan of {} found {} open ports", host, open.len());
        open
    }
}

/// Scans `host` with the default timeout and concurrency.
pub async fn scan_open_ports(host: &str, start_port: u16, end_port: u16) -> Vec<u16> {
    PortScanner::default().scan(host, start_port, end_port).await
}

/// Resolves `host` to a single address, preferring IPv4.
async fn resolve_host(host: &str) -> Option<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Some(ip);
    }

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, 0)).await.ok()?.collect();
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .map(|addr| addr.ip())
}
