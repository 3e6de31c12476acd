//! Local IPC between launches of the application.
//!
//! The primary instance runs an [`IpcServer`]; secondary launches use the
//! functions in [`client`] to forward their arguments or request a restart.

pub mod client;
pub mod protocol;
pub mod server;

use thiserror::Error;

pub use client::{forward_args, request_restart};
pub use protocol::{Endpoint, IpcMessage};
pub use server::{IpcEvent, IpcServer};

/// Error type for IPC operations
#[derive(Debug, Error)]
pub enum IpcError {
    /// Socket / pipe I/O failed
    #[error("ipc i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A bounded wait elapsed
    #[error("ipc operation timed out")]
    Timeout,

    /// Another live process already serves the endpoint
    #[error("endpoint already served by another process: {endpoint}")]
    AlreadyServed { endpoint: String },

    /// The peer answered with something other than the expected reply
    #[error("unexpected reply from peer: {reply:?}")]
    UnexpectedReply { reply: String },

    /// The local state directory is unusable
    #[error("state directory unusable: {0}")]
    StateDir(String),
}

impl From<tokio::time::error::Elapsed> for IpcError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        IpcError::Timeout
    }
}
