//! Control channel between the CLI and a running share.
//!
//! A running share listens on a Unix Domain Socket under the data directory
//! (see [`Config::control_socket`]). `lanshare access …` sends its change
//! there, so it takes effect on the live [`AccessPolicy`] at once. Without a
//! running share the same request is applied to the list files directly.
//!
//! The protocol is newline-delimited JSON: one [`IpcRequest`] per line, each
//! answered by one [`IpcResponse`] line.

#[cfg(unix)]
mod client;
mod messages;
#[cfg(unix)]
mod server;

#[cfg(unix)]
pub use client::IpcClient;
pub use messages::{IpcRequest, IpcResponse};
#[cfg(unix)]
pub use server::{IpcConnection, IpcServer};

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::access::AccessPolicy;
use crate::config::Config;

/// How long the CLI waits for a running share to accept a connection.
#[cfg(unix)]
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors that can occur during IPC communication.
#[derive(Debug, Error)]
pub enum IpcError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A JSON serialization/deserialization error occurred.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Another share already answers on the socket.
    #[error("a share is already listening on {0:?}")]
    AlreadyRunning(PathBuf),
}

/// Applies `request` to `policy` and describes the outcome.
pub fn handle_request(policy: &AccessPolicy, request: IpcRequest) -> IpcResponse {
    match request {
        IpcRequest::Ping => IpcResponse::Pong,
        IpcRequest::ListAccess => IpcResponse::AccessLists {
            allowed: policy.allowed(),
            blocked: policy.blocked(),
        },
        IpcRequest::Allow { ip } => IpcResponse::AccessUpdated {
            changed: policy.add_allowed(&ip),
        },
        IpcRequest::Unallow { ip } => IpcResponse::AccessUpdated {
            changed: policy.remove_allowed(&ip),
        },
        IpcRequest::Block { ip } => IpcResponse::AccessUpdated {
            changed: policy.add_blocked(&ip),
        },
        IpcRequest::Unblock { ip } => IpcResponse::AccessUpdated {
            changed: policy.remove_blocked(&ip),
        },
    }
}

/// Background task serving the control socket of a running share.
pub struct ControlListener {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ControlListener {
    /// Binds `path` and starts answering requests against `policy`.
    #[cfg(unix)]
    pub async fn spawn(path: &Path, policy: Arc<AccessPolicy>) -> Result<Self, IpcError> {
        let server = IpcServer::bind(path).await?;
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.serve(policy, shutdown.clone()));
        Ok(Self { shutdown, task })
    }

    /// Control sockets need Unix Domain Sockets.
    #[cfg(not(unix))]
    pub async fn spawn(path: &Path, _policy: Arc<AccessPolicy>) -> Result<Self, IpcError> {
        Err(IpcError::Io(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("control socket {:?} needs Unix Domain Sockets", path),
        )))
    }

    /// Stops listening and removes the socket file.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!("Control listener ended abnormally: {}", e);
        }
    }
}

/// Sends `request` to the share running with `config`, or applies it to the
/// list files when no share answers on the control socket.
pub async fn apply_access_request(
    config: &Config,
    request: IpcRequest,
) -> Result<IpcResponse, IpcError> {
    #[cfg(unix)]
    {
        let socket = config.control_socket();
        if let Ok(mut client) = IpcClient::connect_with_timeout(&socket, CONNECT_TIMEOUT).await {
            tracing::debug!("Sending {:?} to the running share at {:?}", request, socket);
            return client.send(request).await;
        }
    }

    tracing::debug!("No running share, updating the list files directly");
    let policy = AccessPolicy::from_files(config.allowed_file(), config.blocked_file());
    Ok(tokio::task::spawn_blocking(move || handle_request(&policy, request))
        .await
        .map_err(io::Error::other)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_policy(dir: &Path) -> AccessPolicy {
        AccessPolicy::from_files(dir.join("allowed.json"), dir.join("blocked.json"))
    }

    #[test]
    fn test_handle_request_updates_lists() {
        let temp_dir = tempfile::tempdir().unwrap();
        let policy = empty_policy(temp_dir.path());

        let response = handle_request(
            &policy,
            IpcRequest::Allow {
                ip: "10.0.0.1".to_string(),
            },
        );
        assert_eq!(response, IpcResponse::AccessUpdated { changed: true });

        let response = handle_request(
            &policy,
            IpcRequest::Allow {
                ip: "10.0.0.1".to_string(),
            },
        );
        assert_eq!(response, IpcResponse::AccessUpdated { changed: false });

        handle_request(
            &policy,
            IpcRequest::Block {
                ip: "10.0.0.2".to_string(),
            },
        );
        assert_eq!(
            handle_request(&policy, IpcRequest::ListAccess),
            IpcResponse::AccessLists {
                allowed: vec!["10.0.0.1".to_string()],
                blocked: vec!["10.0.0.2".to_string()],
            }
        );
    }

    #[test]
    fn test_handle_request_removals() {
        let temp_dir = tempfile::tempdir().unwrap();
        let policy = empty_policy(temp_dir.path());
        policy.add_allowed("10.0.0.1");
        policy.add_blocked("10.0.0.2");

        let unallow = handle_request(
            &policy,
            IpcRequest::Unallow {
                ip: "10.0.0.1".to_string(),
            },
        );
        let unblock = handle_request(
            &policy,
            IpcRequest::Unblock {
                ip: "10.0.0.2".to_string(),
            },
        );

        assert_eq!(unallow, IpcResponse::AccessUpdated { changed: true });
        assert_eq!(unblock, IpcResponse::AccessUpdated { changed: true });
        assert!(policy.allowed().is_empty());
        assert!(policy.blocked().is_empty());
    }

    #[test]
    fn test_ping() {
        let temp_dir = tempfile::tempdir().unwrap();
        let policy = empty_policy(temp_dir.path());
        assert_eq!(handle_request(&policy, IpcRequest::Ping), IpcResponse::Pong);
    }

    #[tokio::test]
    async fn test_apply_without_running_share_writes_files() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.daemon.data_dir = temp_dir.path().to_path_buf();

        let response = apply_access_request(
            &config,
            IpcRequest::Block {
                ip: "10.0.0.3".to_string(),
            },
        )
        .await
        .unwrap();
        assert_eq!(response, IpcResponse::AccessUpdated { changed: true });

        let reloaded = AccessPolicy::from_files(config.allowed_file(), config.blocked_file());
        assert_eq!(reloaded.blocked(), vec!["10.0.0.3".to_string()]);
    }
}
