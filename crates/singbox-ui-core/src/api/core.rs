//! AppSupervisor, the facade the event loop drives.
//!
//! It owns every long-lived resource of the primary instance: the instance
//! lock, the IPC server, the running core, the subscription store and the
//! log file. Only the loop task touches it, so nothing inside is locked.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use crate::config::Settings;
use crate::instance::InstanceLock;
use crate::ipc::IpcServer;
use crate::logfile::LogFile;
use crate::subscription::SubscriptionStore;
use crate::supervisor::SupervisedProcess;

use super::events::{AppEvent, FetchOutcome};

/// Default broadcast channel capacity
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Facade over the primary instance's services.
///
/// Constructed via [`AppSupervisorBuilder`](super::builder::AppSupervisorBuilder).
pub struct AppSupervisor {
    settings: Arc<Settings>,
    /// Held for the lifetime of the primary instance
    lock: Option<InstanceLock>,
    ipc_server: Option<IpcServer>,
    /// The one running core, if any
    pub(super) process: Option<SupervisedProcess>,
    pub(super) subscriptions: SubscriptionStore,
    log: LogFile,
    event_tx: broadcast::Sender<AppEvent>,
    fetch_tx: mpsc::UnboundedSender<FetchOutcome>,
    fetch_rx: Option<mpsc::UnboundedReceiver<FetchOutcome>>,
}

impl AppSupervisor {
    /// Create a new AppSupervisor (prefer `AppSupervisorBuilder`)
    pub(crate) fn new(
        settings: Arc<Settings>,
        lock: Option<InstanceLock>,
        ipc_server: Option<IpcServer>,
        subscriptions: SubscriptionStore,
        log: LogFile,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();
        Self {
            settings,
            lock,
            ipc_server,
            process: None,
            subscriptions,
            log,
            event_tx,
            fetch_tx,
            fetch_rx: Some(fetch_rx),
        }
    }

    /// Application settings (read-only)
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The instance lock, if this supervisor holds one
    pub fn lock(&self) -> Option<&InstanceLock> {
        self.lock.as_ref()
    }

    /// The IPC server, if bound
    pub fn ipc_server(&self) -> Option<&IpcServer> {
        self.ipc_server.as_ref()
    }

    /// Stored subscriptions
    pub fn subscriptions(&self) -> &SubscriptionStore {
        &self.subscriptions
    }

    /// Log file shared with the core's output capture
    pub fn log_file(&self) -> &LogFile {
        &self.log
    }

    /// Pid of the running core
    pub fn core_pid(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.pid())
    }

    /// Receiver for finished config downloads. Available once; the event
    /// loop owns it and passes each outcome to
    /// [`apply_fetched_config`](Self::apply_fetched_config).
    pub fn take_fetch_results(&mut self) -> Option<mpsc::UnboundedReceiver<FetchOutcome>> {
        self.fetch_rx.take()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<AppEvent> {
        self.event_tx.clone()
    }

    pub(crate) fn fetch_sender(&self) -> mpsc::UnboundedSender<FetchOutcome> {
        self.fetch_tx.clone()
    }

    /// Drop the IPC server and release the instance lock
    pub(super) fn release_instance(&mut self) {
        if let Some(server) = self.ipc_server.take() {
            tracing::debug!("Closing IPC endpoint {}", server.endpoint());
        }
        if let Some(mut lock) = self.lock.take() {
            lock.release();
        }
    }
}
