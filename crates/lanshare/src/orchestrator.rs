//! Share orchestrator.
//!
//! Ties the access policy, the share server and the optional gateway port
//! mapping together, and reports lifecycle changes as [`ShareEvent`]s.

use std::fs;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, OnceCell, RwLock};
use tracing::{info, warn};

use crate::access::AccessPolicy;
use crate::config::Config;
use crate::gateway::{GatewayDiscovery, GatewayPortMapper, IgdDiscovery};
use crate::ipc::ControlListener;
use crate::network::{is_port_free, local_address};
use crate::server::{ServerState, ShareServer, TlsMaterial};

/// Gateway forwarding status of the share port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ForwardingState {
    /// No mapping requested.
    Inactive,
    /// The gateway forwards `port` to this host.
    Active { port: u16 },
    /// A mapping was requested but the gateway refused or was not found.
    Failed { port: u16 },
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum ShareEvent {
    /// Share server state changed.
    StateChanged(ServerState),
    /// Gateway forwarding changed.
    ForwardingChanged(ForwardingState),
    /// Error occurred.
    Error { message: String },
}

/// URLs under which the share is reachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    /// URL for clients on the local network.
    pub local_url: String,
    /// URL for clients on the internet, when the port is forwarded.
    pub public_url: Option<String>,
}

/// Runs a share: server, access policy and gateway mapping.
pub struct ShareOrchestrator {
    config: Config,
    policy: Arc<AccessPolicy>,
    server: ShareServer,
    discovery: Arc<dyn GatewayDiscovery>,
    /// Discovered on first use and kept for the orchestrator's lifetime.
    mapper: OnceCell<GatewayPortMapper>,
    forwarding: RwLock<ForwardingState>,
    /// Held for the whole of `start` and `stop`. Owns the control socket
    /// listener while the share runs.
    lifecycle: Mutex<Option<ControlListener>>,
    event_tx: broadcast::Sender<ShareEvent>,
}

impl ShareOrchestrator {
    /// Creates an orchestrator using UPnP IGD for port mapping.
    pub fn new(config: Config) -> Self {
        Self::with_discovery(config, Arc::new(IgdDiscovery::new()))
    }

    /// Creates an orchestrator with a custom gateway discovery.
    pub fn with_discovery(config: Config, discovery: Arc<dyn GatewayDiscovery>) -> Self {
        let policy = Arc::new(AccessPolicy::from_files(
            config.allowed_file(),
            config.blocked_file(),
        ));
        let server = ShareServer::new(config.root_dir()).with_shutdown_grace(config.shutdown_grace());
        let (event_tx, _) = broadcast::channel(64);

        Self {
            config,
            policy,
            server,
            discovery,
            mapper: OnceCell::new(),
            forwarding: RwLock::new(ForwardingState::Inactive),
            lifecycle: Mutex::new(None),
            event_tx,
        }
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<ShareEvent> {
        self.event_tx.subscribe()
    }

    /// The configuration this orchestrator was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shared access policy consulted by the server.
    pub fn policy(&self) -> &Arc<AccessPolicy> {
        &self.policy
    }

    /// Current share server state.
    pub async fn state(&self) -> ServerState {
        self.server.state().await
    }

    /// Current gateway forwarding state.
    pub async fn forwarding(&self) -> ForwardingState {
        *self.forwarding.read().await
    }

    /// Starts sharing on the configured port.
    ///
    /// A failed gateway mapping is reported through [`ShareEvent`]s and the
    /// forwarding state; it does not fail the start. A concurrent `stop`
    /// waits until the start, gateway mapping included, has finished.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut control = self.lifecycle.lock().await;
        if self.server.state().await != ServerState::Stopped {
            anyhow::bail!("Share server is already running");
        }

        let port = self.config.server.port;
        if !is_port_free(port) {
            let message = format!("Port {} is already in use", port);
            self.emit(ShareEvent::Error {
                message: message.clone(),
            });
            anyhow::bail!(message);
        }

        let root = self.config.root_dir();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create share directory {:?}", root))?;

        let tls = self
            .config
            .tls
            .material()
            .map(|(cert, key)| TlsMaterial::new(cert, key));

        info!("Starting share on port {}...", port);
        self.emit(ShareEvent::StateChanged(ServerState::Starting));

        let addr = match self
            .server
            .start(port, Arc::clone(&self.policy), tls.as_ref())
            .await
        {
            Ok(addr) => addr,
            Err(e) => {
                self.emit(ShareEvent::Error {
                    message: e.to_string(),
                });
                self.emit(ShareEvent::StateChanged(ServerState::Stopped));
                return Err(e).context("Failed to start share server");
            }
        };
        self.emit(ShareEvent::StateChanged(ServerState::Running));

        let socket = self.config.control_socket();
        match ControlListener::spawn(&socket, Arc::clone(&self.policy)).await {
            Ok(listener) => *control = Some(listener),
            Err(e) => warn!("Control socket {:?} unavailable: {}", socket, e),
        }

        if self.config.gateway.upnp_enabled {
            self.forward(port).await;
        }

        Ok(addr)
    }

    async fn forward(&self, port: u16) {
        let mapper = self.mapper().await;
        let state = if mapper.add_mapping(port).await {
            info!("Port {} forwarded on the gateway", port);
            ForwardingState::Active { port }
        } else {
            warn!("Server started but port forwarding failed for port {}", port);
            self.emit(ShareEvent::Error {
                message: format!("Port forwarding failed for port {}", port),
            });
            ForwardingState::Failed { port }
        };

        *self.forwarding.write().await = state;
        self.emit(ShareEvent::ForwardingChanged(state));
    }

    /// Removes the gateway mapping, if any, then stops the server and the
    /// control socket.
    pub async fn stop(&self) -> Result<()> {
        let mut control = self.lifecycle.lock().await;
        let previous = {
            let mut forwarding = self.forwarding.write().await;
            std::mem::replace(&mut *forwarding, ForwardingState::Inactive)
        };

        if previous != ForwardingState::Inactive {
            if let ForwardingState::Active { port } = previous {
                if let Some(mapper) = self.mapper.get() {
                    if !mapper.remove_mapping(port).await {
                        warn!("Port mapping for port {} could not be removed", port);
                    }
                }
            }
            self.emit(ShareEvent::ForwardingChanged(ForwardingState::Inactive));
        }

        let was_running = self.server.state().await != ServerState::Stopped;
        self.server
            .stop()
            .await
            .context("Failed to stop share server")?;
        if let Some(listener) = control.take() {
            listener.stop().await;
        }
        if was_running {
            self.emit(ShareEvent::StateChanged(ServerState::Stopped));
        }
        Ok(())
    }

    /// URLs a client can use to reach the share.
    pub async fn connection_info(&self) -> ConnectionInfo {
        let scheme = if self.config.tls.material().is_some() {
            "https"
        } else {
            "http"
        };
        let port = self.config.server.port;
        let local_url = format!("{}://{}:{}", scheme, local_address(), port);

        let public_url = match self.forwarding().await {
            ForwardingState::Active { port } => match self.mapper.get() {
                Some(mapper) => mapper
                    .external_address()
                    .await
                    .map(|ip| format!("{}://{}:{}", scheme, ip, port)),
                None => None,
            },
            _ => None,
        };

        ConnectionInfo {
            local_url,
            public_url,
        }
    }

    /// The gateway mapper, discovered on first call.
    pub async fn mapper(&self) -> &GatewayPortMapper {
        self.mapper
            .get_or_init(|| async {
                GatewayPortMapper::discover(
                    self.discovery.as_ref(),
                    self.config.discovery_timeout(),
                    &self.config.gateway.description,
                )
                .await
            })
            .await
    }

    fn emit(&self, event: ShareEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }
}
