//! sing-box process supervision
//!
//! [`SupervisedProcess`] owns one running core with its log capture;
//! [`command`] holds the one-shot invocations (`reload`, `version`) and
//! stray-process cleanup.

pub mod capture;
pub mod command;
pub mod process;

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub use capture::{decode_line, LogCapture};
pub use command::{kill_stray, probe_version, reload};
pub use process::SupervisedProcess;

/// Timing bounds for starting and stopping the core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorOptions {
    /// How long a fresh process must stay alive to count as started
    pub startup_grace: Duration,
    /// Graceful termination window before a forced kill
    pub stop_timeout: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_millis(1000),
            stop_timeout: Duration::from_millis(3000),
        }
    }
}

/// Liveness of a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    /// Exit code, `None` when terminated by a signal
    Exited(Option<i32>),
}

impl ProcessStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessStatus::Running)
    }
}

/// Why the core could not be started
#[derive(Debug, Error)]
pub enum StartError {
    #[error("sing-box executable not found at {path}")]
    NotFound { path: PathBuf },

    #[error("working directory {path} does not exist")]
    MissingWorkDir { path: PathBuf },

    #[error("failed to spawn {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("sing-box exited immediately (code {})", display_code(.code))]
    ExitedImmediately { code: Option<i32> },
}

fn display_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "unknown".to_string(),
    }
}
