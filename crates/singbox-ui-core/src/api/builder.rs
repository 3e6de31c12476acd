//! Builder for constructing an [`AppSupervisor`] instance.
//!
//! ```ignore
//! let core = AppSupervisorBuilder::new(settings)
//!     .with_lock(lock)
//!     .with_ipc_server(server)
//!     .build()?;
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::Settings;
use crate::instance::InstanceLock;
use crate::ipc::IpcServer;
use crate::logfile::LogFile;
use crate::subscription::SubscriptionStore;

use super::core::AppSupervisor;

/// Builder for constructing an [`AppSupervisor`] facade
pub struct AppSupervisorBuilder {
    settings: Arc<Settings>,
    lock: Option<InstanceLock>,
    ipc_server: Option<IpcServer>,
    log: Option<LogFile>,
}

impl AppSupervisorBuilder {
    /// Create a new builder with the given settings
    pub fn new(settings: Settings) -> Self {
        Self::from_shared_settings(Arc::new(settings))
    }

    /// Create a new builder from already-shared settings
    pub fn from_shared_settings(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            lock: None,
            ipc_server: None,
            log: None,
        }
    }

    /// Hand over the instance lock won during launch coordination
    pub fn with_lock(mut self, lock: InstanceLock) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Set the IPC server secondary launches talk to
    pub fn with_ipc_server(mut self, server: IpcServer) -> Self {
        self.ipc_server = Some(server);
        self
    }

    /// Use an existing log file handle (shared with the tracing layer)
    pub fn with_log_file(mut self, log: LogFile) -> Self {
        self.log = Some(log);
        self
    }

    /// Build the `AppSupervisor`.
    ///
    /// Fails if the subscription store exists but cannot be read; starting
    /// with an empty list would overwrite it on the next save.
    pub fn build(self) -> Result<AppSupervisor> {
        let store_path = &self.settings.subscriptions.store;
        let subscriptions = SubscriptionStore::load(store_path)
            .with_context(|| format!("Failed to load subscriptions from {}", store_path.display()))?;

        let log = self.log.unwrap_or_else(|| {
            LogFile::new(&self.settings.logging.file, self.settings.logging.rotate_hours)
        });

        Ok(AppSupervisor::new(
            self.settings,
            self.lock,
            self.ipc_server,
            subscriptions,
            log,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::MutexName;

    fn settings_in(dir: &tempfile::TempDir) -> Settings {
        let mut settings = Settings::default();
        settings.subscriptions.store = dir.path().join("subscriptions.json");
        settings.logging.file = dir.path().join("app.log");
        settings
    }

    #[test]
    fn test_builder_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let core = AppSupervisorBuilder::new(settings_in(&dir)).build().unwrap();

        assert!(core.lock().is_none());
        assert!(core.ipc_server().is_none());
        assert!(core.subscriptions().is_empty());
        assert_eq!(core.log_file().path(), dir.path().join("app.log"));
        assert_eq!(core.settings().core.poll_interval_ms, 700);
    }

    #[cfg(unix)]
    #[test]
    fn test_builder_with_lock() {
        let dir = tempfile::tempdir().unwrap();
        let lock = InstanceLock::acquire(&MutexName::from_path(dir.path().join("app.lock"))).unwrap();
        let core = AppSupervisorBuilder::new(settings_in(&dir))
            .with_lock(lock)
            .build()
            .unwrap();
        assert!(core.lock().is_some_and(|l| l.is_held()));
    }

    #[test]
    fn test_builder_rejects_corrupt_store() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("subscriptions.json"), "[[[").unwrap();
        assert!(AppSupervisorBuilder::new(settings_in(&dir)).build().is_err());
    }

    #[test]
    fn test_builder_from_shared_settings() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(settings_in(&dir));
        let core = AppSupervisorBuilder::from_shared_settings(settings.clone())
            .build()
            .unwrap();
        assert_eq!(core.settings().subscriptions.store, settings.subscriptions.store);
    }
}
