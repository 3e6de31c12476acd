use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use super::capture::LogCapture;
use super::{ProcessStatus, StartError, SupervisorOptions};
use crate::logfile::LogFile;

/// Interval between exit checks while waiting on the child
const WAIT_TICK: Duration = Duration::from_millis(25);

/// Upper bound for draining the capture threads after the child is gone
const CAPTURE_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Keep console children from flashing a window on Windows
pub(crate) fn hide_console(cmd: &mut Command) {
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
    #[cfg(not(windows))]
    let _ = cmd;
}

/// A running sing-box instance with its output capture
pub struct SupervisedProcess {
    executable: PathBuf,
    args: Vec<String>,
    work_dir: PathBuf,
    child: Child,
    pid: u32,
    capture: LogCapture,
    stop_timeout: Duration,
    /// Exit status once observed; never goes back to running
    exited: Option<Option<i32>>,
    stopped: bool,
}

impl SupervisedProcess {
    /// Spawn `executable` with `args` in `work_dir` and wait out the startup
    /// grace period. Output goes to `log`.
    pub fn start(
        executable: &Path,
        args: &[String],
        work_dir: &Path,
        log: &LogFile,
        options: &SupervisorOptions,
    ) -> Result<Self, StartError> {
        if !executable.is_file() {
            return Err(StartError::NotFound {
                path: executable.to_path_buf(),
            });
        }
        if !work_dir.is_dir() {
            return Err(StartError::MissingWorkDir {
                path: work_dir.to_path_buf(),
            });
        }

        let mut cmd = Command::new(executable);
        cmd.args(args)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        hide_console(&mut cmd);

        let mut child = cmd.spawn().map_err(|source| StartError::Spawn {
            path: executable.to_path_buf(),
            source,
        })?;
        let pid = child.id();

        let mut streams: Vec<(&'static str, Box<dyn Read + Send>)> = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            streams.push(("stdout", Box::new(stdout)));
        }
        if let Some(stderr) = child.stderr.take() {
            streams.push(("stderr", Box::new(stderr)));
        }
        let capture = LogCapture::spawn(streams, log.clone());

        tracing::debug!(
            "Spawned {} {} (pid {})",
            executable.display(),
            args.join(" "),
            pid
        );

        let mut process = Self {
            executable: executable.to_path_buf(),
            args: args.to_vec(),
            work_dir: work_dir.to_path_buf(),
            child,
            pid,
            capture,
            stop_timeout: options.stop_timeout,
            exited: None,
            stopped: false,
        };

        // A core with a broken config dies within the grace period
        let deadline = Instant::now() + options.startup_grace;
        loop {
            if let ProcessStatus::Exited(code) = process.poll() {
                process.capture.finish(CAPTURE_JOIN_TIMEOUT);
                process.stopped = true;
                return Err(StartError::ExitedImmediately { code });
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(WAIT_TICK.min(options.startup_grace));
        }

        tracing::info!("sing-box started (pid {})", pid);
        Ok(process)
    }

    /// Non-blocking liveness check
    pub fn poll(&mut self) -> ProcessStatus {
        if let Some(code) = self.exited {
            return ProcessStatus::Exited(code);
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exited = Some(status.code());
                ProcessStatus::Exited(status.code())
            }
            Ok(None) => ProcessStatus::Running,
            Err(e) => {
                tracing::warn!("Failed to query sing-box (pid {}): {}", self.pid, e);
                ProcessStatus::Running
            }
        }
    }

    /// Terminate gracefully, force kill after the stop timeout, then drain
    /// the capture threads. Safe to call more than once.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        if self.poll().is_running() {
            if let Err(e) = self.terminate() {
                tracing::debug!("Graceful stop of pid {} failed: {}", self.pid, e);
            }
            if !self.wait_exit(self.stop_timeout) {
                tracing::warn!(
                    "sing-box (pid {}) did not exit within {:?}, killing",
                    self.pid,
                    self.stop_timeout
                );
                let _ = self.child.kill();
                match self.child.wait() {
                    Ok(status) => self.exited = Some(status.code()),
                    Err(e) => tracing::warn!("Failed to reap pid {}: {}", self.pid, e),
                }
            }
        }

        self.capture.finish(CAPTURE_JOIN_TIMEOUT);
        tracing::info!("sing-box stopped (pid {})", self.pid);
    }

    /// Poll until the child exits or `timeout` passes
    fn wait_exit(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.poll().is_running() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(WAIT_TICK);
        }
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> anyhow::Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM)?;
        Ok(())
    }

    #[cfg(windows)]
    fn terminate(&mut self) -> anyhow::Result<()> {
        let mut cmd = Command::new("taskkill");
        cmd.args(["/PID", &self.pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        hide_console(&mut cmd);

        // taskkill without /F only asks; a console child has no window to
        // receive the request, so a refusal means kill now
        let status = cmd.status()?;
        if !status.success() {
            self.child.kill()?;
        }
        Ok(())
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }
}

impl Drop for SupervisedProcess {
    fn drop(&mut self) {
        self.stop();
    }
}
