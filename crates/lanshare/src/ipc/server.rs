//! IPC server answering access list commands over a Unix Domain Socket.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::messages::{IpcRequest, IpcResponse};
use super::{handle_request, IpcError};
use crate::access::AccessPolicy;

/// A server that listens for IPC connections on a Unix Domain Socket.
///
/// The socket file is removed when the server is dropped.
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Binds the server to `path`, creating parent directories.
    ///
    /// A leftover socket file from a share that is no longer running is
    /// replaced. If another share still answers on it, binding fails with
    /// [`IpcError::AlreadyRunning`].
    pub async fn bind(path: &Path) -> Result<Self, IpcError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if path.exists() {
            if UnixStream::connect(path).await.is_ok() {
                return Err(IpcError::AlreadyRunning(path.to_path_buf()));
            }
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Accept a new incoming connection.
    pub async fn accept(&self) -> Result<IpcConnection, io::Error> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(IpcConnection::new(stream))
    }

    /// Answers requests against `policy` until `shutdown` is cancelled.
    pub async fn serve(self, policy: Arc<AccessPolicy>, shutdown: CancellationToken) {
        debug!("Control socket listening on {:?}", self.path);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.accept() => match accepted {
                    Ok(conn) => {
                        tokio::spawn(serve_connection(conn, Arc::clone(&policy)));
                    }
                    Err(e) => warn!("Failed to accept control connection: {}", e),
                },
            }
        }

        debug!("Control socket {:?} closed", self.path);
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove control socket {:?}: {}", self.path, e);
            }
        }
    }
}

async fn serve_connection(mut conn: IpcConnection, policy: Arc<AccessPolicy>) {
    loop {
        let response = match conn.read_request().await {
            Ok(Some(request)) => {
                let policy = Arc::clone(&policy);
                // Mutations write the list files
                tokio::task::spawn_blocking(move || handle_request(&policy, request))
                    .await
                    .unwrap_or_else(|e| IpcResponse::Error {
                        message: format!("request failed: {}", e),
                    })
            }
            Ok(None) => break,
            Err(IpcError::Json(e)) => IpcResponse::Error {
                message: format!("malformed request: {}", e),
            },
            Err(e) => {
                debug!("Control connection failed: {}", e);
                break;
            }
        };

        if let Err(e) = conn.send_response(&response).await {
            debug!("Failed to answer control request: {}", e);
            break;
        }
    }
}

/// A connection to an IPC client, speaking newline-delimited JSON.
pub struct IpcConnection {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
}

impl IpcConnection {
    fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    /// Read the next request from the client.
    ///
    /// Returns `None` if the client has disconnected.
    pub async fn read_request(&mut self) -> Result<Option<IpcRequest>, IpcError> {
        let mut line = String::new();
        let bytes_read = self.reader.read_line(&mut line).await?;

        if bytes_read == 0 {
            return Ok(None);
        }

        let request = serde_json::from_str(line.trim())?;
        Ok(Some(request))
    }

    /// Send a response to the client.
    pub async fn send_response(&mut self, response: &IpcResponse) -> Result<(), IpcError> {
        let mut json = serde_json::to_string(response)?;
        json.push('\n');

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;

        Ok(())
    }
}
