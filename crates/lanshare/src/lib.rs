//! # LanShare Library
//!
//! This crate shares a local directory over HTTP(S) on the local network,
//! optionally making it reachable from the internet through a UPnP gateway
//! port mapping.
//!
//! ## Overview
//!
//! - **Share Server**: Read-only file serving with a graceful stop
//! - **Access Control**: Persistent allow/block lists checked per request
//! - **Gateway Mapping**: Best-effort UPnP IGD port forwarding
//! - **Network Probing**: Port availability checks, local address, port scans
//! - **Control Socket**: Access list changes reach a running share
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Share Orchestrator                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐   │
//! │  │    Share     │  │    Access    │  │     Gateway      │   │
//! │  │    Server    │──│    Policy    │  │   Port Mapper    │   │
//! │  └──────────────┘  └──────────────┘  └──────────────────┘   │
//! │                                                             │
//! │  ┌───────────────────────────────────────────────────────┐  │
//! │  │                    Network Probe                      │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lanshare::{Config, ShareOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let orchestrator = ShareOrchestrator::new(config);
//!     orchestrator.start().await?;
//!
//!     println!("Sharing at {}", orchestrator.connection_info().await.local_url);
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`access`]: Allowed/blocked address sets and their persistence
//! - [`gateway`]: Gateway discovery and port mapping
//! - [`network`]: Port probing and local address lookup
//! - [`server`]: The HTTP(S) share server
//! - [`ipc`]: Control socket for a running share
//! - [`orchestrator`]: Ties the above together

pub mod access;
pub mod config;
pub mod gateway;
pub mod ipc;
pub mod network;
pub mod orchestrator;
pub mod server;

pub use config::Config;

pub use access::{AccessPolicy, AddressSet, AddressStore, JsonAddressStore, StoreError};

pub use gateway::{
    GatewayControl, GatewayDiscovery, GatewayError, GatewayPortMapper, IgdDiscovery,
    MappingProtocol, PortMapping,
};

pub use ipc::{ControlListener, IpcError, IpcRequest, IpcResponse};

pub use network::{is_port_free, local_address, scan_open_ports, PortScanner};

pub use server::{ServerError, ServerState, ShareServer, TlsMaterial};

pub use orchestrator::{ConnectionInfo, ForwardingState, ShareEvent, ShareOrchestrator};
