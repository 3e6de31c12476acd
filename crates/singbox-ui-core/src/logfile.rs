//! Append-only application log file
//!
//! Shared by the application's own tracing output and the sing-box log
//! capture thread. Every write is a separate open-append-close, so both
//! writers can use the file without coordinating. The file is truncated at
//! most once per rotation interval; the time of the last truncation is kept
//! in a `<file>.rotated` marker next to it.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use tracing_subscriber::fmt::MakeWriter;

/// Timestamp format prefixed to captured lines
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Handle to the log file (cheap to clone)
#[derive(Debug, Clone)]
pub struct LogFile {
    path: PathBuf,
    rotate_every: chrono::Duration,
}

impl LogFile {
    /// Log file at `path`, truncated at most once per `rotate_hours`
    pub fn new(path: impl Into<PathBuf>, rotate_hours: u64) -> Self {
        Self {
            path: path.into(),
            rotate_every: chrono::Duration::hours(rotate_hours.max(1) as i64),
        }
    }

    /// Path of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the rotation marker
    fn marker_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".rotated");
        PathBuf::from(name)
    }

    fn open_append(&self) -> io::Result<fs::File> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        OpenOptions::new().create(true).append(true).open(&self.path)
    }

    /// Append one line prefixed with the local time
    pub fn append_line(&self, line: &str) -> io::Result<()> {
        let stamp = Local::now().format(TIMESTAMP_FORMAT);
        let mut file = self.open_append()?;
        writeln!(file, "[{}] {}", stamp, line)
    }

    /// Append already formatted bytes
    pub fn append_raw(&self, bytes: &[u8]) -> io::Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let mut file = self.open_append()?;
        file.write_all(bytes)
    }

    /// Time of the last truncation, if one was recorded
    pub fn last_rotation(&self) -> Option<DateTime<Utc>> {
        let raw = fs::read_to_string(self.marker_path()).ok()?;
        DateTime::parse_from_rfc3339(raw.trim())
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Truncate the file if the last truncation is older than the rotation
    /// interval (or was never recorded). Returns whether it truncated.
    pub fn rotate_if_due(&self, now: DateTime<Utc>) -> io::Result<bool> {
        if let Some(last) = self.last_rotation() {
            if now.signed_duration_since(last) < self.rotate_every {
                return Ok(false);
            }
        }

        if self.path.exists() {
            OpenOptions::new()
                .write(true)
                .truncate(true)
                .open(&self.path)?;
        }
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(self.marker_path(), now.to_rfc3339())?;
        Ok(true)
    }
}

/// Buffers one tracing event and appends it when dropped
pub struct LogFileWriter {
    file: LogFile,
    buf: Vec<u8>,
}

impl Write for LogFileWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for LogFileWriter {
    fn drop(&mut self) {
        // A logger has nowhere to report its own failure
        let _ = self.file.append_raw(&self.buf);
    }
}

impl<'a> MakeWriter<'a> for LogFile {
    type Writer = LogFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogFileWriter {
            file: self.clone(),
            buf: Vec::new(),
        }
    }
}
