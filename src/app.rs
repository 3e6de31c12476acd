//! Primary instance event loop
//!
//! `run` decides through launch coordination whether this process is the
//! primary instance. If so it binds the IPC endpoint, builds the
//! [`AppSupervisor`] and drives it until Ctrl-C or a restart request.

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use singbox_ui_core::api::{AppEvent, AppSupervisor, AppSupervisorBuilder, IpcFlow};
use singbox_ui_core::instance::{self, LaunchOutcome, LaunchRequest};
use singbox_ui_core::ipc::{IpcEvent, IpcServer};
use singbox_ui_core::logfile::LogFile;
use singbox_ui_core::supervisor;

use crate::config::{Command, Config, Settings};

/// Capacity of the IPC event channel
const IPC_CHANNEL_CAPACITY: usize = 32;

/// How often the log file is checked for rotation
const ROTATION_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

/// Entry point after logging is set up
pub async fn run(cli: Config, settings: Settings, log: LogFile) -> Result<ExitCode> {
    match cli.command {
        Some(Command::Version) => return Ok(print_version(&settings).await),
        Some(Command::Reload) => {
            return Ok(if reload_once(&settings).await {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        None => {}
    }

    let request = LaunchRequest {
        args: cli.args.clone(),
        restart: cli.restart,
    };
    let endpoint = settings.instance.endpoint();
    let outcome = instance::coordinate(
        &settings.instance.mutex(),
        &endpoint,
        &request,
        &settings.instance.coordination_options(),
    )
    .await;

    let lock = match outcome {
        LaunchOutcome::Primary { lock } => lock,
        LaunchOutcome::Forwarded | LaunchOutcome::Unreachable => return Ok(ExitCode::SUCCESS),
    };

    let (ipc_tx, ipc_rx) = mpsc::channel(IPC_CHANNEL_CAPACITY);
    let mut builder = AppSupervisorBuilder::new(settings.clone()).with_log_file(log);
    match IpcServer::bind(endpoint.clone(), settings.instance.read_timeout(), ipc_tx).await {
        Ok(server) => {
            tracing::info!("Listening for other launches on {}", server.endpoint());
            builder = builder.with_ipc_server(server);
        }
        // Secondary launches will find us unreachable; keep running anyway
        Err(e) => tracing::warn!("IPC endpoint unavailable: {}", e),
    }
    if let Some(lock) = lock {
        builder = builder.with_lock(lock);
    }

    let mut core = builder.build().context("Failed to initialize")?;
    event_loop(&mut core, &cli.args, ipc_rx).await;
    Ok(ExitCode::SUCCESS)
}

async fn event_loop(core: &mut AppSupervisor, args: &[String], mut ipc_rx: mpsc::Receiver<IpcEvent>) {
    let Some(mut fetch_rx) = core.take_fetch_results() else {
        tracing::error!("Fetch results already taken");
        return;
    };
    let mut events = core.subscribe();

    core.cleanup_strays().await;
    core.handle_args(args);
    if core.settings().core.autostart {
        core.start_core().await;
    }

    let mut poll = tokio::time::interval(core.settings().core.poll_interval());
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut rotation = tokio::time::interval(ROTATION_CHECK_INTERVAL);
    rotation.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Consumed by the startup rotation in main
    rotation.tick().await;

    let mut shutdown_at: Option<Instant> = None;
    let mut ipc_open = true;

    loop {
        tokio::select! {
            event = ipc_rx.recv(), if ipc_open => {
                match event {
                    Some(event) => {
                        if let IpcFlow::ShutdownAfter(delay) = core.handle_ipc(event) {
                            shutdown_at.get_or_insert_with(|| Instant::now() + delay);
                        }
                    }
                    None => {
                        tracing::debug!("IPC server closed");
                        ipc_open = false;
                    }
                }
            }
            Some(outcome) = fetch_rx.recv() => {
                core.apply_fetched_config(outcome).await;
            }
            _ = poll.tick() => {
                core.poll_core();
            }
            _ = rotation.tick() => {
                match core.log_file().rotate_if_due(Utc::now()) {
                    Ok(true) => tracing::info!("Log file rotated"),
                    Ok(false) => {}
                    Err(e) => tracing::warn!("Log rotation failed: {}", e),
                }
            }
            Ok(event) = events.recv() => {
                report(&event);
            }
            _ = sleep_until_opt(shutdown_at) => {
                tracing::info!("Shutting down for restart");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, shutting down");
                break;
            }
        }
    }

    core.shutdown().await;
}

/// Sleep until `deadline`, or forever when there is none
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Headless stand-in for the tray: surface user-facing events in the log
fn report(event: &AppEvent) {
    match event {
        AppEvent::CoreStarted { pid } => tracing::info!("sing-box running (pid {})", pid),
        AppEvent::CoreStartFailed { reason } => tracing::error!("sing-box failed to start: {}", reason),
        AppEvent::CoreExited { code } => tracing::warn!("sing-box exited (code {:?})", code),
        AppEvent::CoreReloaded { ok: false } => tracing::warn!("sing-box rejected the new config"),
        AppEvent::WindowActivated => tracing::info!("Activation requested by another launch"),
        AppEvent::SubscriptionFailed { url, reason } => {
            tracing::warn!("Subscription {} failed: {}", url, reason)
        }
        _ => {}
    }
}

async fn probe_core(settings: &Settings) -> Option<String> {
    let executable = settings.core.executable.clone();
    let timeout = settings.core.reload_timeout();
    tokio::task::spawn_blocking(move || supervisor::probe_version(&executable, timeout))
        .await
        .ok()
        .flatten()
}

async fn print_version(settings: &Settings) -> ExitCode {
    println!("singbox-ui {}", env!("CARGO_PKG_VERSION"));
    match probe_core(settings).await {
        Some(version) => {
            println!("sing-box {}", version);
            ExitCode::SUCCESS
        }
        None => {
            eprintln!(
                "sing-box not available at {}",
                settings.core.executable.display()
            );
            ExitCode::FAILURE
        }
    }
}

async fn reload_once(settings: &Settings) -> bool {
    let core = settings.core.clone();
    tokio::task::spawn_blocking(move || {
        supervisor::reload(&core.executable, &core.config_path, &core.work_dir, core.reload_timeout())
    })
    .await
    .unwrap_or(false)
}
