//! IPC server for the primary instance
//!
//! Listens on the local endpoint and turns every incoming connection into a
//! single [`IpcEvent`] for the owning event loop. Each connection is read
//! for at most `read_timeout`; the restart handshake is answered inline so
//! the new launch gets its acknowledgement before the teardown starts.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::protocol::{is_sentinel, Endpoint, IpcMessage, MAX_PAYLOAD};
use super::IpcError;

/// What a connection asked the primary to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpcEvent {
    /// Process forwarded command line arguments, then restore the window
    Arguments(Vec<String>),
    /// Acknowledged restart request; shut down shortly
    Restart,
    /// Connection without payload; just restore the window
    Activate,
}

/// IPC server owned by the primary instance
pub struct IpcServer {
    endpoint: Endpoint,
    accept_task: JoinHandle<()>,
}

impl IpcServer {
    /// Bind the endpoint and start accepting connections.
    ///
    /// Events are delivered on `events`; the accept loop ends when the
    /// receiver is dropped or the server is dropped.
    pub async fn bind(
        endpoint: Endpoint,
        read_timeout: Duration,
        events: mpsc::Sender<IpcEvent>,
    ) -> Result<Self, IpcError> {
        #[cfg(unix)]
        let accept_task = {
            let listener = bind_listener(&endpoint).await?;
            tokio::spawn(accept_loop(listener, read_timeout, events))
        };

        #[cfg(windows)]
        let accept_task = {
            let first = create_pipe(&endpoint, true).map_err(|e| {
                if e.kind() == std::io::ErrorKind::PermissionDenied {
                    IpcError::AlreadyServed {
                        endpoint: endpoint.to_string(),
                    }
                } else {
                    IpcError::Io(e)
                }
            })?;
            tokio::spawn(accept_loop(endpoint.clone(), first, read_timeout, events))
        };

        tracing::debug!("IPC server started on {}", endpoint);
        Ok(Self {
            endpoint,
            accept_task,
        })
    }

    /// Endpoint this server is bound to
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

/// Bind the Unix socket, clearing a stale socket file left by a dead process
#[cfg(unix)]
async fn bind_listener(endpoint: &Endpoint) -> Result<tokio::net::UnixListener, IpcError> {
    use std::os::unix::fs::PermissionsExt;

    let sock = endpoint.path();
    if let Some(dir) = sock.parent() {
        ensure_state_dir(dir)?;
    }

    if sock.exists() {
        match tokio::net::UnixStream::connect(sock).await {
            Ok(_) => {
                return Err(IpcError::AlreadyServed {
                    endpoint: endpoint.to_string(),
                });
            }
            Err(_) => {
                // Stale socket, safe to remove
                std::fs::remove_file(sock)?;
            }
        }
    }

    let listener = tokio::net::UnixListener::bind(sock)?;

    // Set socket permissions to owner-only
    std::fs::set_permissions(sock, std::fs::Permissions::from_mode(0o700))?;

    Ok(listener)
}

/// Accept loop for incoming launches
#[cfg(unix)]
async fn accept_loop(
    listener: tokio::net::UnixListener,
    read_timeout: Duration,
    events: mpsc::Sender<IpcEvent>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => spawn_handler(stream, read_timeout, events.clone()),
            Err(e) => {
                tracing::warn!("IPC accept error: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
        if events.is_closed() {
            break;
        }
    }
}

#[cfg(windows)]
fn create_pipe(
    endpoint: &Endpoint,
    first: bool,
) -> std::io::Result<tokio::net::windows::named_pipe::NamedPipeServer> {
    tokio::net::windows::named_pipe::ServerOptions::new()
        .first_pipe_instance(first)
        .create(endpoint.pipe_name())
}

/// Accept loop for incoming launches
///
/// A named pipe instance serves one client; a fresh instance is created
/// before the connected one is handed off.
#[cfg(windows)]
async fn accept_loop(
    endpoint: Endpoint,
    mut server: tokio::net::windows::named_pipe::NamedPipeServer,
    read_timeout: Duration,
    events: mpsc::Sender<IpcEvent>,
) {
    loop {
        if let Err(e) = server.connect().await {
            tracing::warn!("IPC accept error: {}", e);
            tokio::time::sleep(Duration::from_millis(100)).await;
            continue;
        }
        let connected = server;
        server = match create_pipe(&endpoint, false) {
            Ok(next) => next,
            Err(e) => {
                tracing::warn!("Failed to create next pipe instance: {}", e);
                spawn_handler(connected, read_timeout, events);
                return;
            }
        };
        spawn_handler(connected, read_timeout, events.clone());
        if events.is_closed() {
            break;
        }
    }
}

fn spawn_handler<S>(stream: S, read_timeout: Duration, events: mpsc::Sender<IpcEvent>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = handle_connection(stream, read_timeout, events).await {
            tracing::debug!("IPC connection ended: {}", e);
        }
    });
}

/// Handle a single launch connection
async fn handle_connection<S>(
    mut stream: S,
    read_timeout: Duration,
    events: mpsc::Sender<IpcEvent>,
) -> Result<(), IpcError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let payload = read_payload(&mut stream, read_timeout).await;

    let event = match IpcMessage::decode(&payload) {
        Some(IpcMessage::Restart) => {
            stream.write_all(&IpcMessage::RestartAck.encode()).await?;
            stream.flush().await?;
            let _ = stream.shutdown().await;
            tracing::info!("Restart requested by a new instance");
            IpcEvent::Restart
        }
        Some(IpcMessage::Arguments(args)) => {
            tracing::debug!("Received {} forwarded argument(s)", args.len());
            IpcEvent::Arguments(args)
        }
        Some(IpcMessage::RestartAck) => {
            tracing::debug!("Ignoring stray restart acknowledgement");
            IpcEvent::Activate
        }
        None => IpcEvent::Activate,
    };

    if events.send(event).await.is_err() {
        tracing::debug!("IPC event receiver is gone");
    }
    Ok(())
}

/// Read whatever the peer sends within `wait`.
///
/// Stops at EOF, when the wait elapses, on a read error, or as soon as the
/// bytes form a complete sentinel (the handshake peer keeps its side open
/// to read the reply).
pub(crate) async fn read_payload<S>(stream: &mut S, wait: Duration) -> Vec<u8>
where
    S: AsyncRead + Unpin,
{
    let deadline = tokio::time::Instant::now() + wait;
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    while buf.len() < MAX_PAYLOAD {
        match tokio::time::timeout_at(deadline, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                buf.extend_from_slice(&chunk[..n]);
                if is_sentinel(&buf) {
                    break;
                }
            }
            Ok(Err(e)) => {
                tracing::debug!("IPC read error: {}", e);
                break;
            }
            Err(_) => break,
        }
    }
    buf
}

/// Ensure state directory exists with proper permissions
#[cfg(unix)]
fn ensure_state_dir(dir: &std::path::Path) -> Result<(), IpcError> {
    use std::os::unix::fs::PermissionsExt;

    // Check for symlink attack before creating
    if dir.exists() {
        let meta = std::fs::symlink_metadata(dir)?;
        if meta.is_symlink() {
            return Err(IpcError::StateDir(format!(
                "{} is a symlink (possible attack)",
                dir.display()
            )));
        }
    }
    std::fs::create_dir_all(dir)?;
    let metadata = std::fs::metadata(dir)?;
    if !metadata.is_dir() {
        return Err(IpcError::StateDir(format!(
            "{} is not a directory",
            dir.display()
        )));
    }
    let mode = metadata.permissions().mode() & 0o777;
    if mode != 0o700 {
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.accept_task.abort();
        #[cfg(unix)]
        {
            let _ = std::fs::remove_file(self.endpoint.path());
        }
        tracing::debug!("IPC server on {} closed", self.endpoint);
    }
}
