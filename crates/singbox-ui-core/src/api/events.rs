//! Events pushed to frontends.
//!
//! Consumers call [`AppSupervisor::subscribe()`] and render whatever they
//! need (tray icon, notifications, the main window) from these.

use std::time::Duration;

use tokio::sync::broadcast;

use super::core::AppSupervisor;

/// State changes emitted by the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    /// sing-box survived its startup grace period
    CoreStarted { pid: u32 },

    /// sing-box could not be started
    CoreStartFailed { reason: String },

    /// sing-box exited on its own
    CoreExited { code: Option<i32> },

    /// sing-box was stopped on request
    CoreStopped,

    /// A `reload` invocation finished
    CoreReloaded { ok: bool },

    /// Another launch asked for the main window
    WindowActivated,

    /// A deep link or explicit import added (or found) a subscription
    SubscriptionImported {
        index: usize,
        name: String,
        url: String,
        /// `false` when the URL was already stored
        added: bool,
    },

    /// A subscription's config was downloaded
    SubscriptionUpdated { index: usize, name: String },

    /// Downloading a subscription's config failed
    SubscriptionFailed { url: String, reason: String },

    /// A newer launch asked this instance to quit
    RestartRequested,

    /// The supervisor is tearing down
    ShuttingDown,
}

/// What the event loop should do after an IPC event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcFlow {
    Continue,
    /// Shut down once the delay has passed, so the acknowledgement reaches
    /// the restarting launch first
    ShutdownAfter(Duration),
}

/// Result of a background config download
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// Index of the subscription at the time the download started
    pub index: usize,
    pub url: String,
    /// Config body, or the error message
    pub result: Result<String, String>,
}

impl AppSupervisor {
    /// Subscribe to supervisor events.
    ///
    /// A receiver that falls behind loses the oldest events (lagged).
    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.event_sender().subscribe()
    }

    /// Send an event; ignored when nobody listens
    pub(crate) fn emit(&self, event: AppEvent) {
        tracing::debug!("Event: {:?}", event);
        let _ = self.event_sender().send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::builder::AppSupervisorBuilder;
    use crate::config::Settings;

    #[tokio::test]
    async fn test_subscribe_receives_events() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.subscriptions.store = dir.path().join("subscriptions.json");
        settings.logging.file = dir.path().join("app.log");
        let core = AppSupervisorBuilder::new(settings).build().unwrap();

        let mut rx = core.subscribe();
        core.emit(AppEvent::WindowActivated);
        core.emit(AppEvent::CoreReloaded { ok: true });

        assert_eq!(rx.recv().await.unwrap(), AppEvent::WindowActivated);
        assert_eq!(rx.recv().await.unwrap(), AppEvent::CoreReloaded { ok: true });
    }

    #[test]
    fn test_emit_without_subscribers() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.subscriptions.store = dir.path().join("subscriptions.json");
        let core = AppSupervisorBuilder::new(settings).build().unwrap();
        core.emit(AppEvent::ShuttingDown);
    }
}
