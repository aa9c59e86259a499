//! Read-only HTTP(S) share server.
//!
//! [`ShareServer`] serves a directory over HTTP/1.1, optionally behind TLS.
//! Every request is checked against the [`AccessPolicy`](crate::access::AccessPolicy)
//! before any file is touched. Denied peers get a 403 and are disconnected.
//! Directories without an `index.html` are answered with an HTML listing.

mod listing;
pub mod share;
pub mod tls;

use std::path::PathBuf;

use thiserror::Error;

pub use share::{ServerState, ShareServer, DEFAULT_SHUTDOWN_GRACE, FORBIDDEN_MESSAGE};
pub use tls::TlsMaterial;

/// Errors returned by [`ShareServer`].
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server is {0:?}, expected stopped")]
    NotStopped(ServerState),

    #[error("invalid port {0}: must be between 1 and 65535")]
    InvalidPort(u16),

    #[error("share root {0:?} is not a directory")]
    InvalidRoot(PathBuf),

    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read TLS material {path:?}: {source}")]
    TlsMaterial {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificate found in {0:?}")]
    NoCertificate(PathBuf),

    #[error("no private key found in {0:?}")]
    NoPrivateKey(PathBuf),

    #[error("invalid TLS configuration: {0}")]
    Tls(#[from] rustls::Error),

    #[error("accept loop terminated abnormally: {0}")]
    AcceptLoop(#[from] tokio::task::JoinError),
}
