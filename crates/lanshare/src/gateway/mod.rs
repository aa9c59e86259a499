//! Gateway port mapping.
//!
//! The port-mapping protocol is a capability behind two traits so it can be
//! swapped for a mock in tests:
//!
//! - [`GatewayDiscovery`] finds a gateway within a bounded delay
//! - [`GatewayControl`] talks to the gateway that was found
//!
//! [`GatewayPortMapper`] wraps both and degrades every operation to a safe
//! no-op when no gateway could be discovered. [`IgdDiscovery`] is the UPnP IGD
//! implementation used in production.

pub mod igd;
pub mod mapper;

use std::fmt;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

pub use igd::IgdDiscovery;
pub use mapper::GatewayPortMapper;

/// Errors reported by a gateway capability.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No gateway answered discovery.
    #[error("gateway discovery failed: {0}")]
    Discovery(String),

    /// Discovery did not finish within the allowed delay.
    #[error("gateway discovery timed out after {0:?}")]
    DiscoveryTimeout(Duration),

    /// The gateway was found but this host has no route toward it.
    #[error("no local address toward gateway {0}")]
    NoLanAddress(SocketAddr),

    /// A control request was rejected or failed.
    #[error("gateway request failed: {0}")]
    Request(String),
}

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Boxed future returned by gateway capabilities.
pub type GatewayFuture<'a, T> = Pin<Box<dyn Future<Output = GatewayResult<T>> + Send + 'a>>;

/// Transport protocol of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MappingProtocol {
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "UDP")]
    Udp,
}

impl MappingProtocol {
    /// Protocol name as gateways report it.
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingProtocol::Tcp => "TCP",
            MappingProtocol::Udp => "UDP",
        }
    }
}

impl fmt::Display for MappingProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One mapping as reported by the gateway. A snapshot, never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortMapping {
    /// Internet-facing port.
    pub external_port: u16,
    /// Transport protocol.
    pub protocol: MappingProtocol,
    /// LAN host the port is forwarded to.
    pub internal_address: String,
    /// Port on the LAN host.
    pub internal_port: u16,
    /// Free-text description set by whoever created the mapping.
    pub description: String,
}

/// Control interface of a discovered gateway.
pub trait GatewayControl: Send + Sync {
    /// Address of this host on the gateway's LAN.
    fn lan_address(&self) -> IpAddr;

    /// Forwards `external_port` to `internal`.
    fn add_port_mapping<'a>(
        &'a self,
        protocol: MappingProtocol,
        external_port: u16,
        internal: SocketAddr,
        description: &'a str,
    ) -> GatewayFuture<'a, ()>;

    /// Deletes the mapping for `external_port`.
    fn remove_port_mapping(
        &self,
        protocol: MappingProtocol,
        external_port: u16,
    ) -> GatewayFuture<'_, ()>;

    /// Internet-facing address of the gateway.
    fn external_ip(&self) -> GatewayFuture<'_, IpAddr>;

    /// Mapping at `index`, or `None` once the index is past the last entry.
    fn mapping_at(&self, index: u32) -> GatewayFuture<'_, Option<PortMapping>>;
}

/// Finds a gateway on the local network.
pub trait GatewayDiscovery: Send + Sync {
    /// Searches for a gateway, giving up after roughly `timeout`.
    fn discover(&self, timeout: Duration) -> GatewayFuture<'_, Arc<dyn GatewayControl>>;
}
