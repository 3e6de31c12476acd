//! Action methods on [`AppSupervisor`].
//!
//! Blocking work (spawning or stopping the core, `reload`, downloads) runs
//! on tokio's blocking pool so the event loop keeps serving IPC.

use crate::deeplink::{self, DeepLink};
use crate::ipc::IpcEvent;
use crate::subscription::{self, ImportResult};
use crate::supervisor::{self, ProcessStatus, SupervisedProcess};

use super::core::AppSupervisor;
use super::events::{AppEvent, FetchOutcome, IpcFlow};

impl AppSupervisor {
    // =========================================================
    // Core process
    // =========================================================

    /// Start sing-box unless it is already running.
    ///
    /// Returns whether a core is running afterwards.
    pub async fn start_core(&mut self) -> bool {
        if self.poll_core() == Some(ProcessStatus::Running) {
            return true;
        }

        let core = &self.settings().core;
        let executable = core.executable.clone();
        let work_dir = core.work_dir.clone();
        let args = core.run_args();
        let options = core.supervisor_options();
        let log = self.log_file().clone();

        let spawned = tokio::task::spawn_blocking(move || {
            SupervisedProcess::start(&executable, &args, &work_dir, &log, &options)
        })
        .await;

        match spawned {
            Ok(Ok(process)) => {
                let pid = process.pid();
                self.process = Some(process);
                self.emit(AppEvent::CoreStarted { pid });
                true
            }
            Ok(Err(e)) => {
                tracing::error!("Failed to start sing-box: {}", e);
                self.emit(AppEvent::CoreStartFailed {
                    reason: e.to_string(),
                });
                false
            }
            Err(e) => {
                tracing::error!("sing-box start task failed: {}", e);
                self.emit(AppEvent::CoreStartFailed {
                    reason: e.to_string(),
                });
                false
            }
        }
    }

    /// Stop the running core, if any
    pub async fn stop_core(&mut self) {
        let Some(mut process) = self.process.take() else {
            return;
        };
        if let Err(e) = tokio::task::spawn_blocking(move || process.stop()).await {
            tracing::warn!("sing-box stop task failed: {}", e);
        }
        self.emit(AppEvent::CoreStopped);
    }

    /// Apply the current config: `reload` a running core, start a stopped
    /// one. Returns whether the core is running the new config.
    pub async fn reload_core(&mut self) -> bool {
        if self.poll_core() != Some(ProcessStatus::Running) {
            return self.start_core().await;
        }

        let core = &self.settings().core;
        let executable = core.executable.clone();
        let config = core.config_path.clone();
        let work_dir = core.work_dir.clone();
        let timeout = core.reload_timeout();

        let ok = tokio::task::spawn_blocking(move || {
            supervisor::reload(&executable, &config, &work_dir, timeout)
        })
        .await
        .unwrap_or(false);

        self.emit(AppEvent::CoreReloaded { ok });
        ok
    }

    /// Liveness tick. Reports an unexpected exit once and forgets the
    /// process; `None` when no core is supervised.
    pub fn poll_core(&mut self) -> Option<ProcessStatus> {
        let status = self.process.as_mut()?.poll();
        if let ProcessStatus::Exited(code) = status {
            tracing::warn!("sing-box exited unexpectedly (code {:?})", code);
            if let Some(process) = self.process.take() {
                // Dropping drains the capture threads; keep that off the loop
                tokio::task::spawn_blocking(move || drop(process));
            }
            self.emit(AppEvent::CoreExited { code });
        }
        Some(status)
    }

    /// Kill leftover cores from earlier runs (when enabled in settings)
    pub async fn cleanup_strays(&self) {
        if !self.settings().core.cleanup_strays {
            return;
        }
        let name = self.settings().core.executable_name();
        match tokio::task::spawn_blocking(move || supervisor::kill_stray(&name)).await {
            Ok(0) => {}
            Ok(n) => tracing::info!("Killed {} stray sing-box process(es)", n),
            Err(e) => tracing::warn!("Stray cleanup task failed: {}", e),
        }
    }

    // =========================================================
    // IPC and arguments
    // =========================================================

    /// React to a message from another launch
    pub fn handle_ipc(&mut self, event: IpcEvent) -> IpcFlow {
        match event {
            IpcEvent::Arguments(args) => {
                self.handle_args(&args);
                self.emit(AppEvent::WindowActivated);
                IpcFlow::Continue
            }
            IpcEvent::Activate => {
                self.emit(AppEvent::WindowActivated);
                IpcFlow::Continue
            }
            IpcEvent::Restart => {
                tracing::info!("Restart requested by a new launch");
                self.emit(AppEvent::RestartRequested);
                IpcFlow::ShutdownAfter(self.settings().instance.shutdown_delay())
            }
        }
    }

    /// Process command line arguments (deep links). Returns how many
    /// subscriptions were imported or matched.
    pub fn handle_args<S: AsRef<str>>(&mut self, args: &[S]) -> usize {
        let links = deeplink::parse_args(args);
        for link in &links {
            match link {
                DeepLink::ImportSubscription { url, name } => {
                    self.import_subscription(url, name.as_deref());
                }
            }
        }
        links.len()
    }

    // =========================================================
    // Subscriptions
    // =========================================================

    /// Store a subscription and, when it is the current one, download its
    /// config in the background
    pub fn import_subscription(&mut self, url: &str, name: Option<&str>) -> ImportResult {
        let result = self.subscriptions.import(url, name);
        if let Err(e) = self.subscriptions.save() {
            tracing::warn!("Failed to save subscriptions: {}", e);
        }

        let index = result.index();
        let name = self.subscriptions.subscriptions()[index].name.clone();
        tracing::info!("Imported subscription {} ({})", name, url);
        self.emit(AppEvent::SubscriptionImported {
            index,
            name,
            url: url.to_string(),
            added: matches!(result, ImportResult::Added(_)),
        });

        if self.subscriptions.current().map(|(current, _)| current) == Some(index) {
            self.spawn_fetch(index, url.to_string());
        }
        result
    }

    /// Switch to another subscription and fetch its config
    pub fn select_subscription(&mut self, index: usize) -> Result<(), subscription::SubscriptionError> {
        let url = self.subscriptions.select(index)?.url.clone();
        self.subscriptions.save()?;
        self.spawn_fetch(index, url);
        Ok(())
    }

    /// Download the current subscription's config again
    pub fn refresh_current(&mut self) -> bool {
        let Some((index, sub)) = self.subscriptions.current() else {
            return false;
        };
        let url = sub.url.clone();
        self.spawn_fetch(index, url);
        true
    }

    fn spawn_fetch(&self, index: usize, url: String) {
        let tx = self.fetch_sender();
        let timeout = self.settings().subscriptions.fetch_timeout();
        tokio::task::spawn_blocking(move || {
            let result = subscription::fetch_config(&url, timeout).map_err(|e| e.to_string());
            let _ = tx.send(FetchOutcome { index, url, result });
        });
    }

    /// Handle a finished download: write the config if it belongs to the
    /// current subscription and apply it to the core.
    pub async fn apply_fetched_config(&mut self, outcome: FetchOutcome) {
        let config = match outcome.result {
            Ok(config) => config,
            Err(reason) => {
                tracing::warn!("Failed to update subscription {}: {}", outcome.url, reason);
                self.emit(AppEvent::SubscriptionFailed {
                    url: outcome.url,
                    reason,
                });
                return;
            }
        };

        // The list may have changed while the download ran
        let current = match self.subscriptions.current() {
            Some((index, sub)) if index == outcome.index && sub.url == outcome.url => {
                (index, sub.name.clone())
            }
            _ => {
                tracing::debug!("Discarding config for {} (no longer current)", outcome.url);
                return;
            }
        };

        let path = self.settings().core.config_path.clone();
        if let Err(e) = subscription::write_config(&path, &config) {
            tracing::error!("Failed to write config: {}", e);
            self.emit(AppEvent::SubscriptionFailed {
                url: outcome.url,
                reason: e.to_string(),
            });
            return;
        }

        let (index, name) = current;
        tracing::info!("Updated config from subscription {}", name);
        self.emit(AppEvent::SubscriptionUpdated { index, name });

        if self.process.is_some() {
            self.reload_core().await;
        }
    }

    // =========================================================
    // Lifecycle
    // =========================================================

    /// Stop the core, close the IPC endpoint and release the instance
    /// lock, in that order. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        self.emit(AppEvent::ShuttingDown);
        self.stop_core().await;
        self.cleanup_strays().await;
        self.release_instance();
        tracing::info!("Shutdown complete");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use tokio::sync::broadcast;

    use super::*;
    use crate::api::builder::AppSupervisorBuilder;
    use crate::config::Settings;
    use crate::instance::{InstanceLock, MutexName};

    struct Fixture {
        dir: tempfile::TempDir,
        core: AppSupervisor,
        events: broadcast::Receiver<AppEvent>,
    }

    fn write_script(path: &Path, body: &str) {
        std::fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    /// Supervisor whose "sing-box" is a shell script running `body`
    fn fixture_with(body: &str, lock: Option<InstanceLock>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let core_dir = dir.path().join("core");
        std::fs::create_dir_all(&core_dir).unwrap();
        let executable = core_dir.join("sing-box");
        write_script(&executable, body);

        let mut settings = Settings::default();
        settings.core.executable = executable;
        settings.core.work_dir = core_dir;
        settings.core.config_path = dir.path().join("config.json");
        settings.core.cleanup_strays = false;
        settings.core.startup_grace_ms = 100;
        settings.core.stop_timeout_ms = 1000;
        settings.core.reload_timeout_ms = 2000;
        settings.instance.shutdown_delay_ms = 200;
        settings.logging.file = dir.path().join("app.log");
        settings.subscriptions.store = dir.path().join("subscriptions.json");
        settings.subscriptions.fetch_timeout_ms = 200;

        let mut builder = AppSupervisorBuilder::new(settings);
        if let Some(lock) = lock {
            builder = builder.with_lock(lock);
        }
        let core = builder.build().unwrap();
        let events = core.subscribe();
        Fixture { dir, core, events }
    }

    fn fixture(body: &str) -> Fixture {
        fixture_with(body, None)
    }

    /// Drain events until `want` shows up
    async fn expect_event(events: &mut broadcast::Receiver<AppEvent>, want: &AppEvent) {
        let found = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(event) if &event == want => return true,
                    Ok(_) => continue,
                    Err(_) => return false,
                }
            }
        })
        .await;
        assert_eq!(found, Ok(true), "never saw {:?}", want);
    }

    #[tokio::test]
    async fn test_start_and_stop_core() {
        let mut fx = fixture("exec sleep 30");
        assert!(fx.core.start_core().await);
        let pid = fx.core.core_pid().unwrap();
        expect_event(&mut fx.events, &AppEvent::CoreStarted { pid }).await;
        assert_eq!(fx.core.poll_core(), Some(ProcessStatus::Running));

        // Starting again keeps the same process
        assert!(fx.core.start_core().await);
        assert_eq!(fx.core.core_pid(), Some(pid));

        fx.core.stop_core().await;
        expect_event(&mut fx.events, &AppEvent::CoreStopped).await;
        assert_eq!(fx.core.poll_core(), None);
    }

    #[tokio::test]
    async fn test_start_failure_is_reported() {
        let mut fx = fixture("echo 'decode config: bad' >&2; exit 1");
        assert!(!fx.core.start_core().await);
        assert!(fx.core.core_pid().is_none());
        match fx.events.recv().await.unwrap() {
            AppEvent::CoreStartFailed { reason } => assert!(reason.contains("code 1"), "{}", reason),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_poll_reports_exit_once() {
        let mut fx = fixture("sleep 0.3; exit 2");
        assert!(fx.core.start_core().await);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while fx.core.poll_core() == Some(ProcessStatus::Running) {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        expect_event(&mut fx.events, &AppEvent::CoreExited { code: Some(2) }).await;
        assert_eq!(fx.core.poll_core(), None);
    }

    #[tokio::test]
    async fn test_reload_running_core() {
        let mut fx = fixture("[ \"$1\" = reload ] && exit 0; exec sleep 30");
        assert!(fx.core.start_core().await);
        assert!(fx.core.reload_core().await);
        expect_event(&mut fx.events, &AppEvent::CoreReloaded { ok: true }).await;
        fx.core.stop_core().await;
    }

    #[tokio::test]
    async fn test_forwarded_deep_link_imports_subscription() {
        let mut fx = fixture("exec sleep 30");
        let flow = fx.core.handle_ipc(IpcEvent::Arguments(vec![
            "https://example.com/sub#tag_name".to_string(),
        ]));
        assert_eq!(flow, IpcFlow::Continue);

        expect_event(
            &mut fx.events,
            &AppEvent::SubscriptionImported {
                index: 0,
                name: "tag_name".to_string(),
                url: "https://example.com/sub#tag_name".to_string(),
                added: true,
            },
        )
        .await;
        expect_event(&mut fx.events, &AppEvent::WindowActivated).await;

        let stored = &fx.core.subscriptions().subscriptions()[0];
        assert_eq!(stored.url, "https://example.com/sub#tag_name");
        assert!(fx.dir.path().join("subscriptions.json").exists());
    }

    #[tokio::test]
    async fn test_activate_and_restart() {
        let mut fx = fixture("exec sleep 30");
        assert_eq!(fx.core.handle_ipc(IpcEvent::Activate), IpcFlow::Continue);
        expect_event(&mut fx.events, &AppEvent::WindowActivated).await;

        assert_eq!(
            fx.core.handle_ipc(IpcEvent::Restart),
            IpcFlow::ShutdownAfter(Duration::from_millis(200))
        );
        expect_event(&mut fx.events, &AppEvent::RestartRequested).await;
    }

    #[tokio::test]
    async fn test_fetched_config_written_for_current_subscription() {
        let mut fx = fixture("exec sleep 30");
        fx.core.import_subscription("https://a.example/sub", Some("A"));

        fx.core
            .apply_fetched_config(FetchOutcome {
                index: 0,
                url: "https://a.example/sub".to_string(),
                result: Ok(r#"{"outbounds": []}"#.to_string()),
            })
            .await;

        expect_event(
            &mut fx.events,
            &AppEvent::SubscriptionUpdated {
                index: 0,
                name: "A".to_string(),
            },
        )
        .await;
        assert_eq!(
            std::fs::read_to_string(fx.dir.path().join("config.json")).unwrap(),
            r#"{"outbounds": []}"#
        );
    }

    #[tokio::test]
    async fn test_fetched_config_for_other_subscription_discarded() {
        let mut fx = fixture("exec sleep 30");
        fx.core.import_subscription("https://a.example/sub", Some("A"));
        fx.core.import_subscription("https://b.example/sub", Some("B"));

        fx.core
            .apply_fetched_config(FetchOutcome {
                index: 1,
                url: "https://b.example/sub".to_string(),
                result: Ok("{}".to_string()),
            })
            .await;
        assert!(!fx.dir.path().join("config.json").exists());
    }

    #[tokio::test]
    async fn test_failed_fetch_reported() {
        let mut fx = fixture("exec sleep 30");
        fx.core
            .apply_fetched_config(FetchOutcome {
                index: 0,
                url: "https://a.example/sub".to_string(),
                result: Err("connection refused".to_string()),
            })
            .await;
        expect_event(
            &mut fx.events,
            &AppEvent::SubscriptionFailed {
                url: "https://a.example/sub".to_string(),
                reason: "connection refused".to_string(),
            },
        )
        .await;
    }

    #[tokio::test]
    async fn test_import_triggers_background_fetch() {
        let mut fx = fixture("exec sleep 30");
        let mut results = fx.core.take_fetch_results().unwrap();
        // Nothing listens on port 9 of localhost
        fx.core.import_subscription("http://127.0.0.1:9/sub", None);

        let outcome = tokio::time::timeout(Duration::from_secs(5), results.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.index, 0);
        assert_eq!(outcome.url, "http://127.0.0.1:9/sub");
        assert!(outcome.result.is_err());
    }

    #[tokio::test]
    async fn test_import_of_non_current_subscription_skips_fetch() {
        let mut fx = fixture("exec sleep 30");
        let mut results = fx.core.take_fetch_results().unwrap();
        fx.core.import_subscription("http://127.0.0.1:9/a", Some("A"));
        let first = tokio::time::timeout(Duration::from_secs(5), results.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.index, 0);

        fx.core.import_subscription("http://127.0.0.1:9/b", Some("B"));
        let second = tokio::time::timeout(Duration::from_millis(500), results.recv()).await;
        assert!(second.is_err(), "unexpected fetch {:?}", second);
    }

    #[tokio::test]
    async fn test_select_subscription_applies_its_config() {
        let mut fx = fixture("exec sleep 30");
        let mut results = fx.core.take_fetch_results().unwrap();
        fx.core.import_subscription("http://127.0.0.1:9/a", Some("A"));
        fx.core.import_subscription("http://127.0.0.1:9/b", Some("B"));

        fx.core.select_subscription(1).unwrap();
        assert_eq!(fx.core.subscriptions().current().map(|(i, _)| i), Some(1));
        let saved =
            subscription::SubscriptionStore::load(fx.dir.path().join("subscriptions.json")).unwrap();
        assert_eq!(saved.current().map(|(i, _)| i), Some(1));

        // The select queued a download for the newly current entry
        let queued = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match results.recv().await {
                    Some(outcome) if outcome.index == 1 => return outcome.url,
                    Some(_) => continue,
                    None => return String::new(),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(queued, "http://127.0.0.1:9/b");

        fx.core
            .apply_fetched_config(FetchOutcome {
                index: 1,
                url: "http://127.0.0.1:9/b".to_string(),
                result: Ok(r#"{"route": {}}"#.to_string()),
            })
            .await;
        expect_event(
            &mut fx.events,
            &AppEvent::SubscriptionUpdated {
                index: 1,
                name: "B".to_string(),
            },
        )
        .await;
        assert_eq!(
            std::fs::read_to_string(fx.dir.path().join("config.json")).unwrap(),
            r#"{"route": {}}"#
        );
    }

    #[tokio::test]
    async fn test_select_out_of_range_subscription() {
        let mut fx = fixture("exec sleep 30");
        fx.core.import_subscription("https://a.example/sub", Some("A"));
        assert!(matches!(
            fx.core.select_subscription(3),
            Err(subscription::SubscriptionError::NoSuchIndex(3))
        ));
        assert_eq!(fx.core.subscriptions().current().map(|(i, _)| i), Some(0));
    }

    #[tokio::test]
    async fn test_refresh_current() {
        let mut fx = fixture("exec sleep 30");
        let mut results = fx.core.take_fetch_results().unwrap();
        assert!(!fx.core.refresh_current());

        fx.core.import_subscription("http://127.0.0.1:9/sub", None);
        let _initial = tokio::time::timeout(Duration::from_secs(5), results.recv())
            .await
            .unwrap();

        assert!(fx.core.refresh_current());
        let outcome = tokio::time::timeout(Duration::from_secs(5), results.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.index, 0);
        assert_eq!(outcome.url, "http://127.0.0.1:9/sub");
    }

    #[tokio::test]
    async fn test_start_missing_executable() {
        let mut fx = fixture("exec sleep 30");
        std::fs::remove_file(&fx.core.settings().core.executable).unwrap();

        assert!(!fx.core.start_core().await);
        match fx.events.recv().await.unwrap() {
            AppEvent::CoreStartFailed { reason } => {
                assert!(reason.contains("not found"), "{}", reason)
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(fx.core.poll_core(), None);
        assert!(fx.core.core_pid().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_releases_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mutex = MutexName::from_path(dir.path().join("app.lock"));
        let lock = InstanceLock::acquire(&mutex).unwrap();

        let mut fx = fixture_with("exec sleep 30", Some(lock));
        assert!(fx.core.start_core().await);

        fx.core.shutdown().await;
        expect_event(&mut fx.events, &AppEvent::ShuttingDown).await;
        expect_event(&mut fx.events, &AppEvent::CoreStopped).await;
        assert!(fx.core.lock().is_none());
        assert!(fx.core.core_pid().is_none());

        let next = InstanceLock::acquire(&mutex).unwrap();
        assert!(!next.already_existed());

        // Idempotent
        fx.core.shutdown().await;
    }
}
