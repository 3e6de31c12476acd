//! IPC protocol definitions for primary ↔ secondary launch hand-off
//!
//! Payloads are raw UTF-8 without framing: either newline-joined command
//! line arguments, or one of the two restart sentinels. The end of a
//! message is signalled by the sender closing its side of the connection,
//! or (for the handshake) by the payload matching a sentinel exactly.

use std::path::PathBuf;

/// Restart request sent by a launch started with the restart flag
pub const RESTART: &[u8] = b"__RESTART__";

/// Reply written by the primary before it tears down
pub const RESTART_ACK: &[u8] = b"__RESTART_ACK__";

/// Upper bound for a single payload
pub const MAX_PAYLOAD: usize = 64 * 1024;

/// Get the base state directory, preferring XDG_RUNTIME_DIR for security
#[cfg(unix)]
pub fn state_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(xdg).join("singbox-ui")
    } else {
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/singbox-ui-{}", uid))
    }
}

/// Get the base state directory
#[cfg(windows)]
pub fn state_dir() -> PathBuf {
    std::env::temp_dir().join("singbox-ui")
}

/// Address of the local IPC endpoint
///
/// A Unix domain socket under [`state_dir`] on Unix, a named pipe on
/// Windows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    #[cfg(unix)]
    path: PathBuf,
    #[cfg(windows)]
    pipe: String,
}

impl Endpoint {
    /// Endpoint registered under `name` in the default location
    pub fn named(name: &str) -> Self {
        #[cfg(unix)]
        {
            Self {
                path: state_dir().join(format!("{}.sock", name)),
            }
        }
        #[cfg(windows)]
        {
            Self {
                pipe: format!(r"\\.\pipe\{}", name),
            }
        }
    }

    /// Endpoint at an explicit socket path
    #[cfg(unix)]
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Socket path of this endpoint
    #[cfg(unix)]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Pipe name of this endpoint
    #[cfg(windows)]
    pub fn pipe_name(&self) -> &str {
        &self.pipe
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        #[cfg(unix)]
        {
            write!(f, "{}", self.path.display())
        }
        #[cfg(windows)]
        {
            write!(f, "{}", self.pipe)
        }
    }
}

/// A single message exchanged over the endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpcMessage {
    /// Command line arguments of a secondary launch
    Arguments(Vec<String>),
    /// Ask the primary to shut down so a new instance can take over
    Restart,
    /// Primary's acknowledgement of [`IpcMessage::Restart`]
    RestartAck,
}

impl IpcMessage {
    /// Encode the message as wire bytes
    pub fn encode(&self) -> Vec<u8> {
        match self {
            IpcMessage::Arguments(args) => args.join("\n").into_bytes(),
            IpcMessage::Restart => RESTART.to_vec(),
            IpcMessage::RestartAck => RESTART_ACK.to_vec(),
        }
    }

    /// Decode a complete payload.
    ///
    /// Returns `None` for a payload without content (a bare connection,
    /// which only asks for window activation).
    pub fn decode(payload: &[u8]) -> Option<Self> {
        let trimmed = payload.trim_ascii();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed == RESTART {
            return Some(IpcMessage::Restart);
        }
        if trimmed == RESTART_ACK {
            return Some(IpcMessage::RestartAck);
        }

        let text = String::from_utf8_lossy(payload);
        let args: Vec<String> = text
            .split('\n')
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect();
        if args.is_empty() {
            None
        } else {
            Some(IpcMessage::Arguments(args))
        }
    }
}

/// Whether `buf` already holds a full sentinel, so the reader can stop
/// waiting for the peer to close.
pub fn is_sentinel(buf: &[u8]) -> bool {
    buf == RESTART || buf == RESTART_ACK
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_sentinels_are_literal() {
        assert_eq!(IpcMessage::Restart.encode(), b"__RESTART__".to_vec());
        assert_eq!(IpcMessage::RestartAck.encode(), b"__RESTART_ACK__".to_vec());
    }

    #[test]
    fn test_decode_sentinels() {
        assert_eq!(IpcMessage::decode(b"__RESTART__"), Some(IpcMessage::Restart));
        assert_eq!(
            IpcMessage::decode(b"__RESTART_ACK__\n"),
            Some(IpcMessage::RestartAck)
        );
    }

    #[test]
    fn test_arguments_are_newline_joined() {
        let msg = IpcMessage::Arguments(vec![
            "https://example.com/sub#tag_name".to_string(),
            "--minimized".to_string(),
        ]);
        assert_eq!(
            msg.encode(),
            b"https://example.com/sub#tag_name\n--minimized".to_vec()
        );
    }

    #[test]
    fn test_decode_arguments_skips_blank_lines() {
        let decoded = IpcMessage::decode(b"a b\r\n\n  \nsecond\n");
        assert_eq!(
            decoded,
            Some(IpcMessage::Arguments(vec![
                "a b".to_string(),
                "second".to_string()
            ]))
        );
    }

    #[test]
    fn test_decode_empty_payload() {
        assert_eq!(IpcMessage::decode(b""), None);
        assert_eq!(IpcMessage::decode(b" \n\r\n"), None);
    }

    #[test]
    fn test_sentinel_prefix_is_an_argument() {
        // Only an exact match is a handshake
        assert_eq!(
            IpcMessage::decode(b"__RESTART__x"),
            Some(IpcMessage::Arguments(vec!["__RESTART__x".to_string()]))
        );
        assert!(!is_sentinel(b"__RESTART"));
        assert!(is_sentinel(RESTART));
    }

    #[cfg(unix)]
    #[test]
    fn test_state_dir_default() {
        temp_env::with_var_unset("XDG_RUNTIME_DIR", || {
            let dir = state_dir();
            let uid = unsafe { libc::getuid() };
            assert_eq!(dir, PathBuf::from(format!("/tmp/singbox-ui-{}", uid)));
        });
    }

    #[cfg(unix)]
    #[test]
    fn test_endpoint_named_with_xdg() {
        temp_env::with_var("XDG_RUNTIME_DIR", Some("/run/user/1000"), || {
            let endpoint = Endpoint::named("SingBox-UI-IPC");
            assert_eq!(
                endpoint.path(),
                std::path::Path::new("/run/user/1000/singbox-ui/SingBox-UI-IPC.sock")
            );
        });
    }

    #[cfg(windows)]
    #[test]
    fn test_endpoint_named_pipe() {
        let endpoint = Endpoint::named("SingBox-UI-IPC");
        assert_eq!(endpoint.pipe_name(), r"\\.\pipe\SingBox-UI-IPC");
    }
}
