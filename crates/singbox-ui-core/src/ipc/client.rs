//! IPC client used by secondary and restarting launches
//!
//! Every operation is bounded: connecting goes through a [`RetryPolicy`]
//! with a per-attempt timeout, and the restart acknowledgement has its own
//! wait, so a launch can never hang on an unresponsive primary.

use std::time::Duration;

use tokio::io::AsyncWriteExt;

use super::protocol::{Endpoint, IpcMessage};
use super::server::read_payload;
use super::IpcError;
use crate::retry::RetryPolicy;

#[cfg(unix)]
type ClientStream = tokio::net::UnixStream;

#[cfg(windows)]
type ClientStream = tokio::net::windows::named_pipe::NamedPipeClient;

#[cfg(unix)]
async fn connect_once(endpoint: &Endpoint) -> Result<ClientStream, IpcError> {
    Ok(tokio::net::UnixStream::connect(endpoint.path()).await?)
}

#[cfg(windows)]
async fn connect_once(endpoint: &Endpoint) -> Result<ClientStream, IpcError> {
    // A busy pipe (all instances taken) is retried by the policy
    Ok(tokio::net::windows::named_pipe::ClientOptions::new().open(endpoint.pipe_name())?)
}

/// Connect to the primary instance within the policy's bounds
async fn connect(endpoint: &Endpoint, policy: &RetryPolicy) -> Result<ClientStream, IpcError> {
    let stream = policy.retry(move || connect_once(endpoint)).await?;
    tracing::debug!("IPC connected to {}", endpoint);
    Ok(stream)
}

/// Forward a launch's arguments to the primary instance.
///
/// An empty argument list still connects, which makes the primary restore
/// its window.
pub async fn forward_args(
    endpoint: &Endpoint,
    args: &[String],
    policy: &RetryPolicy,
) -> Result<(), IpcError> {
    let mut stream = connect(endpoint, policy).await?;
    let payload = IpcMessage::Arguments(args.to_vec()).encode();
    stream.write_all(&payload).await?;
    stream.flush().await?;
    // Closing our side marks the end of the message
    let _ = stream.shutdown().await;
    tracing::debug!("Forwarded {} argument(s) to primary instance", args.len());
    Ok(())
}

/// Ask the primary instance to shut down and wait for its acknowledgement.
pub async fn request_restart(
    endpoint: &Endpoint,
    policy: &RetryPolicy,
    ack_timeout: Duration,
) -> Result<(), IpcError> {
    let mut stream = connect(endpoint, policy).await?;
    stream.write_all(&IpcMessage::Restart.encode()).await?;
    stream.flush().await?;

    let reply = read_payload(&mut stream, ack_timeout).await;
    match IpcMessage::decode(&reply) {
        Some(IpcMessage::RestartAck) => {
            tracing::debug!("Primary instance acknowledged restart");
            Ok(())
        }
        None => Err(IpcError::Timeout),
        Some(_) => Err(IpcError::UnexpectedReply {
            reply: String::from_utf8_lossy(&reply).into_owned(),
        }),
    }
}
