//! One-shot sing-box invocations and stray-process cleanup

use std::io::{self, Read};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use sysinfo::System;

use super::capture::join_thread_until;
use super::process::hide_console;

/// Output of a finished one-shot invocation
struct Finished {
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

/// Run `executable args` to completion, killing it after `timeout`.
///
/// Returns `Ok(None)` on timeout.
fn run_bounded(
    executable: &Path,
    args: &[&str],
    work_dir: Option<&Path>,
    timeout: Duration,
) -> io::Result<Option<Finished>> {
    let mut cmd = Command::new(executable);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = work_dir {
        cmd.current_dir(dir);
    }
    hide_console(&mut cmd);

    let mut child = cmd.spawn()?;
    let stdout = child.stdout.take().map(|s| drain(Box::new(s)));
    let stderr = child.stderr.take().map(|s| drain(Box::new(s)));

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(Duration::from_millis(20));
    };

    let collect = |reader: Option<thread::JoinHandle<Vec<u8>>>| {
        reader
            .and_then(|r| join_thread_until(r, Instant::now() + Duration::from_secs(1)))
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default()
    };

    Ok(Some(Finished {
        status,
        stdout: collect(stdout),
        stderr: collect(stderr),
    }))
}

fn drain(mut stream: Box<dyn Read + Send>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stream.read_to_end(&mut buf);
        buf
    })
}

/// Ask the running core to re-read `config` (`<core> reload -c <config>`).
///
/// Success is judged by the exit status alone.
pub fn reload(executable: &Path, config: &Path, work_dir: &Path, timeout: Duration) -> bool {
    let config = config.to_string_lossy();
    match run_bounded(executable, &["reload", "-c", &config], Some(work_dir), timeout) {
        Ok(Some(finished)) if finished.status.success() => {
            tracing::info!("sing-box configuration reloaded");
            true
        }
        Ok(Some(finished)) => {
            tracing::warn!(
                "sing-box reload failed ({}): {}",
                finished.status,
                finished.stderr.trim()
            );
            false
        }
        Ok(None) => {
            tracing::warn!("sing-box reload timed out after {:?}", timeout);
            false
        }
        Err(e) => {
            tracing::warn!("Failed to run sing-box reload: {}", e);
            false
        }
    }
}

/// Version of the core binary, from `<core> version`
pub fn probe_version(executable: &Path, timeout: Duration) -> Option<String> {
    match run_bounded(executable, &["version"], None, timeout) {
        Ok(Some(finished)) if finished.status.success() => parse_version(&finished.stdout),
        Ok(_) => None,
        Err(e) => {
            tracing::debug!("Failed to run {} version: {}", executable.display(), e);
            None
        }
    }
}

/// Extract `X.Y.Z` from a `sing-box version X.Y.Z` line
fn parse_version(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        line.trim()
            .strip_prefix("sing-box version ")
            .and_then(|rest| rest.split_whitespace().next())
            .map(str::to_string)
    })
}

/// Kill every process named `executable_name` except ourselves.
///
/// Returns how many processes were signalled.
pub fn kill_stray(executable_name: &str) -> usize {
    let mut sys = System::new();
    sys.refresh_processes();

    let own_pid = std::process::id();
    let mut killed = 0;
    for process in sys.processes().values() {
        if process.pid().as_u32() == own_pid || process.name() != executable_name {
            continue;
        }
        tracing::info!(
            "Killing stray {} (pid {})",
            process.name(),
            process.pid()
        );
        if process.kill() {
            killed += 1;
        }
    }
    killed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        let output = "sing-box version 1.9.3\n\nEnvironment: go1.22.4 linux/amd64\nTags: with_gvisor\n";
        assert_eq!(parse_version(output), Some("1.9.3".to_string()));
        assert_eq!(parse_version("unrelated output"), None);
    }

    #[test]
    fn test_kill_stray_without_matches() {
        assert_eq!(kill_stray("no-such-core-binary-for-tests"), 0);
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        /// Fake core binary: a shell script answering like sing-box
        fn fake_core(dir: &Path, body: &str) -> std::path::PathBuf {
            let path = dir.join("sing-box");
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        #[test]
        fn test_probe_version() {
            let dir = tempfile::tempdir().unwrap();
            let core = fake_core(dir.path(), "echo 'sing-box version 1.10.0'");
            assert_eq!(
                probe_version(&core, Duration::from_secs(5)),
                Some("1.10.0".to_string())
            );
        }

        #[test]
        fn test_reload_success_by_exit_status() {
            let dir = tempfile::tempdir().unwrap();
            let core = fake_core(
                dir.path(),
                "[ \"$1\" = reload ] && [ \"$2\" = -c ] && [ -n \"$3\" ]",
            );
            assert!(reload(&core, Path::new("config.json"), dir.path(), Duration::from_secs(5)));
        }

        #[test]
        fn test_reload_failure() {
            let dir = tempfile::tempdir().unwrap();
            let core = fake_core(dir.path(), "echo 'no such config' >&2; exit 1");
            assert!(!reload(&core, Path::new("config.json"), dir.path(), Duration::from_secs(5)));
        }

        #[test]
        fn test_reload_timeout_is_bounded() {
            let dir = tempfile::tempdir().unwrap();
            let core = fake_core(dir.path(), "exec sleep 30");
            let start = Instant::now();
            assert!(!reload(&core, Path::new("config.json"), dir.path(), Duration::from_millis(200)));
            assert!(start.elapsed() < Duration::from_secs(3));
        }
    }
}
