//! Launch coordination: decide whether this process becomes the primary
//! instance, forwards its arguments, or takes over from a running primary.

use std::time::Duration;

use super::lock::{InstanceLock, MutexName};
use crate::ipc::{self, Endpoint};
use crate::retry::RetryPolicy;

/// What this launch was asked to do
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Command line arguments to hand to the primary (deep links etc.)
    pub args: Vec<String>,
    /// Launch was started to replace the running primary
    pub restart: bool,
}

/// Bounds of the coordination steps
#[derive(Debug, Clone)]
pub struct CoordinationOptions {
    /// Connect loop used by secondary and restarting launches
    pub connect: RetryPolicy,
    /// Wait for the restart acknowledgement
    pub ack_timeout: Duration,
    /// Mutex re-acquisition loop after a restart hand-off
    pub recapture: RetryPolicy,
}

/// Result of [`coordinate`]
#[derive(Debug)]
pub enum LaunchOutcome {
    /// Continue with normal startup.
    ///
    /// `lock` is `None` when the mutex state could not be determined; the
    /// launch proceeds anyway.
    Primary { lock: Option<InstanceLock> },
    /// Arguments were handed to the running primary; exit with code 0
    Forwarded,
    /// A primary exists but could not be reached (e.g. another session);
    /// exit with code 0 without forwarding
    Unreachable,
}

impl LaunchOutcome {
    /// Whether this launch should go on to start the application
    pub fn is_primary(&self) -> bool {
        matches!(self, LaunchOutcome::Primary { .. })
    }
}

/// Run the single-instance state machine for one launch.
///
/// Never fails: every coordination error degrades to "proceed as primary"
/// or "exit quietly", favouring an app that always starts over strict
/// exclusivity across sessions it cannot reach.
pub async fn coordinate(
    mutex: &MutexName,
    endpoint: &Endpoint,
    request: &LaunchRequest,
    options: &CoordinationOptions,
) -> LaunchOutcome {
    let mut lock = match InstanceLock::acquire(mutex) {
        Ok(lock) => lock,
        Err(e) => {
            tracing::warn!("Could not determine instance state ({}); proceeding", e);
            return LaunchOutcome::Primary { lock: None };
        }
    };

    if !lock.already_existed() {
        tracing::debug!("Acquired instance mutex {}", mutex);
        return LaunchOutcome::Primary { lock: Some(lock) };
    }

    if request.restart {
        take_over(lock, mutex, endpoint, options).await
    } else {
        lock.release();
        match ipc::forward_args(endpoint, &request.args, &options.connect).await {
            Ok(()) => {
                tracing::info!("Another instance is running; forwarded arguments to it");
                LaunchOutcome::Forwarded
            }
            Err(e) => {
                tracing::info!("Another instance is running but unreachable: {}", e);
                LaunchOutcome::Unreachable
            }
        }
    }
}

/// Restart hand-off: ask the primary to quit, then capture the mutex
async fn take_over(
    mut lock: InstanceLock,
    mutex: &MutexName,
    endpoint: &Endpoint,
    options: &CoordinationOptions,
) -> LaunchOutcome {
    match ipc::request_restart(endpoint, &options.connect, options.ack_timeout).await {
        Ok(()) => tracing::info!("Previous instance acknowledged restart"),
        Err(e) => tracing::warn!("Restart request was not acknowledged: {}", e),
    }

    // Our own handle would keep the name alive after the old owner exits
    lock.release();

    match InstanceLock::recapture(mutex, &options.recapture).await {
        Ok(lock) => LaunchOutcome::Primary { lock: Some(lock) },
        Err(e) => {
            tracing::warn!("Could not recapture instance mutex ({}); proceeding", e);
            LaunchOutcome::Primary { lock: None }
        }
    }
}
