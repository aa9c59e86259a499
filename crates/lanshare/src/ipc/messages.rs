//! IPC message types for CLI-share communication.

use serde::{Deserialize, Serialize};

/// Requests sent from the CLI to a running share.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum IpcRequest {
    /// Check if the share is alive.
    Ping,
    /// Return both access lists.
    ListAccess,
    /// Add an address to the allowed list.
    Allow { ip: String },
    /// Remove an address from the allowed list.
    Unallow { ip: String },
    /// Add an address to the blocked list.
    Block { ip: String },
    /// Remove an address from the blocked list.
    Unblock { ip: String },
}

/// Responses sent from the share to the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum IpcResponse {
    /// Response to a Ping request.
    Pong,
    /// Both access lists, sorted.
    AccessLists {
        allowed: Vec<String>,
        blocked: Vec<String>,
    },
    /// Result of an access list change.
    AccessUpdated {
        /// False when the list already had the requested content.
        changed: bool,
    },
    /// The request could not be processed.
    Error { message: String },
}
