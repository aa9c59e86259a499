//! Share server lifecycle and connection handling.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use super::listing::list_directories;
use super::{ServerError, TlsMaterial};
use crate::access::AccessPolicy;

/// Time in-flight connections get to finish after `stop` before being aborted.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Body of the response sent to denied peers.
pub const FORBIDDEN_MESSAGE: &str = "Forbidden: Your IP is not allowed to access this server.";

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Lifecycle state of a [`ShareServer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Not listening.
    Stopped,
    /// Binding the listener and loading TLS material.
    Starting,
    /// Accepting connections.
    Running,
    /// Draining connections.
    Stopping,
}

/// Handles owned by a running accept loop.
struct RunningServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    accept_task: JoinHandle<()>,
}

/// Policy and peer for one connection, checked again on every request.
#[derive(Clone)]
struct PeerGate {
    policy: Arc<AccessPolicy>,
    peer: SocketAddr,
}

/// Everything a connection task needs, shared across connections.
struct ConnectionContext {
    policy: Arc<AccessPolicy>,
    files: Router,
    denied: Router,
    tls: Option<TlsAcceptor>,
}

/// Read-only file server gated by an access policy.
pub struct ShareServer {
    root: PathBuf,
    shutdown_grace: Duration,
    state: Arc<RwLock<ServerState>>,
    running: Mutex<Option<RunningServer>>,
}

impl ShareServer {
    /// Creates a stopped server for `root`.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            state: Arc::new(RwLock::new(ServerState::Stopped)),
            running: Mutex::new(None),
        }
    }

    /// Sets how long `stop` waits for in-flight connections.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Directory being served.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ServerState {
        *self.state.read().await
    }

    /// Returns true while the accept loop is running.
    pub async fn is_running(&self) -> bool {
        self.state().await == ServerState::Running
    }

    /// Address the listener is bound to, while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Starts serving on `0.0.0.0:port`.
    ///
    /// Fails without changing state if the server is not stopped. Any other
    /// failure leaves the server `Stopped`.
    pub async fn start(
        &self,
        port: u16,
        policy: Arc<AccessPolicy>,
        tls: Option<&TlsMaterial>,
    ) -> Result<SocketAddr, ServerError> {
        {
            let mut state = self.state.write().await;
            if *state != ServerState::Stopped {
                return Err(ServerError::NotStopped(*state));
            }
            *state = ServerState::Starting;
        }

        match self.launch(port, policy, tls).await {
            Ok(running) => {
                let local_addr = running.local_addr;
                *self.running.lock().await = Some(running);
                *self.state.write().await = ServerState::Running;
                info!(
                    "Share server listening on {} ({}), serving {:?}",
                    local_addr,
                    if tls.is_some() { "https" } else { "http" },
                    self.root
                );
                Ok(local_addr)
            }
            Err(e) => {
                *self.state.write().await = ServerState::Stopped;
                error!("Failed to start share server: {}", e);
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
        port: u16,
        policy: Arc<AccessPolicy>,
        tls: Option<&TlsMaterial>,
    ) -> Result<RunningServer, ServerError> {
        if port == 0 {
            return Err(ServerError::InvalidPort(port));
        }
        if !self.root.is_dir() {
            return Err(ServerError::InvalidRoot(self.root.clone()));
        }

        let tls = tls.map(TlsMaterial::load_acceptor).transpose()?;

        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|source| ServerError::Bind { port, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { port, source })?;

        let context = Arc::new(ConnectionContext {
            policy,
            files: file_router(&self.root),
            denied: denied_router(),
            tls,
        });

        let shutdown = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            context,
            shutdown.clone(),
            self.shutdown_grace,
        ));

        Ok(RunningServer {
            local_addr,
            shutdown,
            accept_task,
        })
    }

    /// Stops accepting, drains in-flight connections up to the grace period
    /// and aborts whatever is left. Does nothing if already stopped.
    pub async fn stop(&self) -> Result<(), ServerError> {
        {
            let mut state = self.state.write().await;
            match *state {
                ServerState::Stopped => return Ok(()),
                ServerState::Running => *state = ServerState::Stopping,
                other => return Err(ServerError::NotStopped(other)),
            }
        }

        info!("Stopping share server...");

        let running = self.running.lock().await.take();
        let result = match running {
            Some(running) => {
                running.shutdown.cancel();
                running.accept_task.await.map_err(ServerError::from)
            }
            None => Ok(()),
        };

        *self.state.write().await = ServerState::Stopped;

        match &result {
            Ok(()) => info!("Share server stopped"),
            Err(e) => error!("Share server stopped with error: {}", e),
        }
        result
    }
}

fn file_router(root: &Path) -> Router {
    Router::new()
        .fallback_service(ServeDir::new(root))
        .layer(middleware::from_fn_with_state(
            Arc::new(root.to_path_buf()),
            list_directories,
        ))
        .layer(TraceLayer::new_for_http())
}

fn denied_router() -> Router {
    Router::new().fallback(|| async { forbidden() })
}

fn forbidden() -> Response {
    (
        StatusCode::FORBIDDEN,
        [(header::CONNECTION, "close")],
        FORBIDDEN_MESSAGE,
    )
        .into_response()
}

async fn enforce_access(State(gate): State<PeerGate>, request: Request, next: Next) -> Response {
    if gate.policy.is_peer_allowed(gate.peer.ip()) {
        return next.run(request).await;
    }
    info!(
        "Denied request for {} from {}",
        request.uri().path(),
        gate.peer
    );
    forbidden()
}

async fn accept_loop(
    listener: TcpListener,
    context: Arc<ConnectionContext>,
    shutdown: CancellationToken,
    grace: Duration,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(handle_connection(
                        stream,
                        peer,
                        Arc::clone(&context),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                log_connection_exit(finished);
            }
        }
    }

    drop(listener);
    debug!(
        "Listener closed, draining {} connections",
        connections.len()
    );

    let drained = tokio::time::timeout(grace, async {
        while let Some(finished) = connections.join_next().await {
            log_connection_exit(finished);
        }
    })
    .await;

    if drained.is_err() {
        warn!(
            "Grace period of {:?} elapsed, aborting {} connections",
            grace,
            connections.len()
        );
        connections.abort_all();
        while connections.join_next().await.is_some() {}
    }
}

fn log_connection_exit(finished: Result<(), tokio::task::JoinError>) {
    if let Err(e) = finished {
        if e.is_panic() {
            error!("Connection task panicked: {}", e);
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    context: Arc<ConnectionContext>,
    shutdown: CancellationToken,
) {
    // Peers already denied at accept time are turned away before the TLS
    // handshake. Allowed connections are checked again on every request.
    let allowed = context.policy.is_peer_allowed(peer.ip());
    let router = if allowed {
        debug!("Accepted connection from {}", peer);
        let gate = PeerGate {
            policy: Arc::clone(&context.policy),
            peer,
        };
        context
            .files
            .clone()
            .layer(middleware::from_fn_with_state(gate, enforce_access))
    } else {
        info!("Denied connection from {}", peer);
        context.denied.clone()
    };

    match &context.tls {
        Some(acceptor) => {
            match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls_stream)) => serve_http(tls_stream, router, allowed, peer, shutdown).await,
                Ok(Err(e)) => debug!("TLS handshake with {} failed: {}", peer, e),
                Err(_) => debug!("TLS handshake with {} timed out", peer),
            }
        }
        None => serve_http(stream, router, allowed, peer, shutdown).await,
    }
}

async fn serve_http<S>(
    io: S,
    router: Router,
    keep_alive: bool,
    peer: SocketAddr,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = TowerToHyperService::new(router);
    let connection = http1::Builder::new()
        .keep_alive(keep_alive)
        .serve_connection(TokioIo::new(io), service);
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = shutdown.cancelled() => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };

    if let Err(e) = result {
        debug!("Connection from {} ended with error: {}", peer, e);
    }
}
