//! Best-effort gateway port mapper.
//!
//! Discovery happens once, at construction. If it fails the mapper is
//! permanently unavailable and every call returns `false`, `None` or an empty
//! list without touching the network. Nothing here returns an error: callers
//! treat every operation as advisory.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::{GatewayControl, GatewayDiscovery, GatewayError, MappingProtocol, PortMapping};

/// Default bounded delay for gateway discovery.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_millis(200);

/// Extra time allowed on top of the discovery delay for the gateway to
/// answer its description request.
const DISCOVERY_SLACK: Duration = Duration::from_secs(2);

/// Description used for mappings when none is configured.
pub const DEFAULT_DESCRIPTION: &str = "LanShare";

/// Upper bound on listing iterations, in case a gateway never reports the end.
const MAX_LISTED_MAPPINGS: u32 = 1024;

/// Port mapper for a gateway discovered once per instance.
pub struct GatewayPortMapper {
    gateway: Option<Arc<dyn GatewayControl>>,
    description: String,
}

impl GatewayPortMapper {
    /// Runs discovery once and returns a mapper.
    ///
    /// Always succeeds; on any discovery error the returned mapper is
    /// unavailable for its whole lifetime.
    pub async fn discover<D>(discovery: &D, timeout: Duration, description: &str) -> Self
    where
        D: GatewayDiscovery + ?Sized,
    {
        let bound = timeout + DISCOVERY_SLACK;
        let result = match tokio::time::timeout(bound, discovery.discover(timeout)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::DiscoveryTimeout(bound)),
        };

        match result {
            Ok(gateway) => {
                info!("Gateway discovered, LAN address {}", gateway.lan_address());
                Self::with_gateway(gateway, description)
            }
            Err(e) => {
                error!("Gateway initialization failed: {}", e);
                Self {
                    gateway: None,
                    description: description.to_string(),
                }
            }
        }
    }

    /// Wraps an already discovered gateway.
    pub fn with_gateway(gateway: Arc<dyn GatewayControl>, description: &str) -> Self {
        Self {
            gateway: Some(gateway),
            description: description.to_string(),
        }
    }

    /// A mapper with no gateway. Every operation is a no-op.
    pub fn unavailable() -> Self {
        Self {
            gateway: None,
            description: DEFAULT_DESCRIPTION.to_string(),
        }
    }

    /// Returns true if a gateway was discovered.
    pub fn is_available(&self) -> bool {
        self.gateway.is_some()
    }

    /// Maps TCP `port` on the gateway to the same port on this host.
    pub async fn add_mapping(&self, port: u16) -> bool {
        let Some(gateway) = &self.gateway else {
            debug!("Skipping mapping for port {}: no gateway", port);
            return false;
        };

        let internal = SocketAddr::new(gateway.lan_address(), port);
        match gateway
            .add_port_mapping(MappingProtocol::Tcp, port, internal, &self.description)
            .await
        {
            Ok(()) => {
                info!("Port mapping added for port {} -> {}", port, internal);
                true
            }
            Err(e) => {
                error!("Failed to add port mapping for port {}: {}", port, e);
                false
            }
        }
    }

    /// Removes the TCP mapping for `port`.
    ///
    /// Returns false when there is no gateway, the mapping does not exist, or
    /// the request fails.
    pub async fn remove_mapping(&self, port: u16) -> bool {
        let Some(gateway) = &self.gateway else {
            debug!("Skipping unmapping of port {}: no gateway", port);
            return false;
        };

        match gateway
            .remove_port_mapping(MappingProtocol::Tcp, port)
            .await
        {
            Ok(()) => {
                info!("Port mapping deleted for port {}", port);
                true
            }
            Err(e) => {
                warn!("Failed to delete port mapping for port {}: {}", port, e);
                false
            }
        }
    }

    /// Public address reported by the gateway.
    pub async fn external_address(&self) -> Option<String> {
        let gateway = self.gateway.as_ref()?;
        match gateway.external_ip().await {
            Ok(ip) => Some(ip.to_string()),
            Err(e) => {
                error!("Failed to get public IP: {}", e);
                None
            }
        }
    }

    /// All mappings the gateway knows about, in gateway order.
    ///
    /// A failure part way through returns what was read up to that point.
    pub async fn list_mappings(&self) -> Vec<PortMapping> {
        let Some(gateway) = &self.gateway else {
            return Vec::new();
        };

        let mut mappings = Vec::new();
        for index in 0..MAX_LISTED_MAPPINGS {
            match gateway.mapping_at(index).await {
                Ok(Some(mapping)) => mappings.push(mapping),
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to list port mappings at index {}: {}", index, e);
                    break;
                }
            }
        }

        debug!("Gateway reported {} port mappings", mappings.len());
        mappings
    }
}
