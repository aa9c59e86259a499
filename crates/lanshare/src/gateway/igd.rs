//! UPnP Internet Gateway Device support.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use igd_next::aio::tokio::{search_gateway, Tokio};
use igd_next::aio::Gateway;
use igd_next::{GetGenericPortMappingEntryError, PortMappingProtocol, SearchOptions};
use tracing::debug;

use super::{
    GatewayControl, GatewayDiscovery, GatewayError, GatewayFuture, MappingProtocol, PortMapping,
};
use crate::network::local_address_toward;

/// Discovers an IGD gateway via SSDP.
#[derive(Debug, Default, Clone, Copy)]
pub struct IgdDiscovery;

impl IgdDiscovery {
    pub fn new() -> Self {
        Self
    }
}

impl GatewayDiscovery for IgdDiscovery {
    fn discover(&self, timeout: Duration) -> GatewayFuture<'_, Arc<dyn GatewayControl>> {
        Box::pin(async move {
            let options = SearchOptions {
                timeout: Some(timeout),
                ..Default::default()
            };

            let gateway = search_gateway(options)
                .await
                .map_err(|e| GatewayError::Discovery(e.to_string()))?;
            debug!("IGD answered from {}", gateway.addr);

            let lan_address = local_address_toward(gateway.addr)
                .ok_or(GatewayError::NoLanAddress(gateway.addr))?;

            let control: Arc<dyn GatewayControl> = Arc::new(IgdGateway {
                gateway,
                lan_address,
            });
            Ok(control)
        })
    }
}

/// A discovered IGD gateway plus the local address facing it.
pub struct IgdGateway {
    gateway: Gateway<Tokio>,
    lan_address: IpAddr,
}

fn to_igd(protocol: MappingProtocol) -> PortMappingProtocol {
    match protocol {
        MappingProtocol::Tcp => PortMappingProtocol::TCP,
        MappingProtocol::Udp => PortMappingProtocol::UDP,
    }
}

fn from_igd(protocol: PortMappingProtocol) -> MappingProtocol {
    match protocol {
        PortMappingProtocol::TCP => MappingProtocol::Tcp,
        PortMappingProtocol::UDP => MappingProtocol::Udp,
    }
}

fn request_error(e: impl std::fmt::Display) -> GatewayError {
    GatewayError::Request(e.to_string())
}

impl GatewayControl for IgdGateway {
    fn lan_address(&self) -> IpAddr {
        self.lan_address
    }

    fn add_port_mapping<'a>(
        &'a self,
        protocol: MappingProtocol,
        external_port: u16,
        internal: SocketAddr,
        description: &'a str,
    ) -> GatewayFuture<'a, ()> {
        Box::pin(async move {
            // Lease 0 keeps the mapping until it is removed.
            self.gateway
                .add_port(to_igd(protocol), external_port, internal, 0, description)
                .await
                .map_err(request_error)
        })
    }

    fn remove_port_mapping(
        &self,
        protocol: MappingProtocol,
        external_port: u16,
    ) -> GatewayFuture<'_, ()> {
        Box::pin(async move {
            self.gateway
                .remove_port(to_igd(protocol), external_port)
                .await
                .map_err(request_error)
        })
    }

    fn external_ip(&self) -> GatewayFuture<'_, IpAddr> {
        Box::pin(async move {
            self.gateway
                .get_external_ip()
                .await
                .map_err(request_error)
        })
    }

    fn mapping_at(&self, index: u32) -> GatewayFuture<'_, Option<PortMapping>> {
        Box::pin(async move {
            match self.gateway.get_generic_port_mapping_entry(index).await {
                Ok(entry) => Ok(Some(PortMapping {
                    external_port: entry.external_port,
                    protocol: from_igd(entry.protocol),
                    internal_address: entry.internal_client,
                    internal_port: entry.internal_port,
                    description: entry.port_mapping_description,
                })),
                Err(GetGenericPortMappingEntryError::SpecifiedArrayIndexInvalid) => Ok(None),
                Err(e) => Err(request_error(e)),
            }
        })
    }
}

