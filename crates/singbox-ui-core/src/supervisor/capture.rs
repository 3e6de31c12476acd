//! Child output capture
//!
//! One reader thread per stream splits raw bytes into lines and decodes
//! them; a single writer thread appends the lines to the [`LogFile`]. The
//! channel between them keeps per-stream order and gives every line exactly
//! one writer.

use std::io::{BufRead, BufReader, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::logfile::LogFile;

/// How often the writer checks the stop flag while idle
const WRITER_TICK: Duration = Duration::from_millis(100);

/// Decode one raw output line.
///
/// Tries UTF-8, then Windows-1251 (Cyrillic consoles), then Latin-1, which
/// never fails.
pub fn decode_line(raw: &[u8]) -> String {
    if let Ok(text) = std::str::from_utf8(raw) {
        return text.to_string();
    }

    let (text, had_errors) = encoding_rs::WINDOWS_1251.decode_without_bom_handling(raw);
    // 0x98 is unassigned in Windows-1251 and only decodes to a C1 control
    if !had_errors && !text.contains('\u{98}') {
        return text.into_owned();
    }

    raw.iter().map(|&b| b as char).collect()
}

/// Strip the line terminator (`\n` or `\r\n`)
fn trim_line_end(mut raw: &[u8]) -> &[u8] {
    if let Some(rest) = raw.strip_suffix(b"\n") {
        raw = rest;
    }
    if let Some(rest) = raw.strip_suffix(b"\r") {
        raw = rest;
    }
    raw
}

/// Running capture threads for one child process
pub struct LogCapture {
    stop: Arc<AtomicBool>,
    readers: Vec<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl LogCapture {
    /// Start capturing `streams` into `log`
    pub fn spawn(streams: Vec<(&'static str, Box<dyn Read + Send>)>, log: LogFile) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel::<String>();

        let readers = streams
            .into_iter()
            .map(|(label, stream)| {
                let tx = tx.clone();
                let stop = stop.clone();
                thread::spawn(move || read_lines(label, stream, tx, stop))
            })
            .collect();
        // Writer ends once every reader has dropped its sender
        drop(tx);

        let writer_stop = stop.clone();
        let writer = thread::spawn(move || write_lines(rx, log, writer_stop));

        Self {
            stop,
            readers,
            writer: Some(writer),
        }
    }

    /// Wait up to `timeout` for the threads to drain, then signal them to
    /// stop. Threads still blocked after that are abandoned.
    pub fn finish(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        for reader in self.readers.drain(..) {
            join_thread_until(reader, deadline);
        }
        self.stop.store(true, Ordering::SeqCst);
        if let Some(writer) = self.writer.take() {
            join_thread_until(writer, deadline + WRITER_TICK * 2);
        }
    }
}

impl Drop for LogCapture {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn read_lines(
    label: &'static str,
    stream: Box<dyn Read + Send>,
    tx: mpsc::Sender<String>,
    stop: Arc<AtomicBool>,
) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = decode_line(trim_line_end(&buf));
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!("sing-box {} read error: {}", label, e);
                break;
            }
        }
        if stop.load(Ordering::SeqCst) {
            break;
        }
    }
    tracing::debug!("sing-box {} closed", label);
}

fn write_lines(rx: mpsc::Receiver<String>, log: LogFile, stop: Arc<AtomicBool>) {
    loop {
        match rx.recv_timeout(WRITER_TICK) {
            Ok(line) => append(&log, &line),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => return,
        }
    }
    // Stop requested: flush what the readers already sent
    while let Ok(line) = rx.try_recv() {
        append(&log, &line);
    }
}

fn append(log: &LogFile, line: &str) {
    if let Err(e) = log.append_line(line) {
        tracing::warn!("Failed to write sing-box output to {}: {}", log.path().display(), e);
    }
}

/// Join a thread, giving up at `deadline`
pub(super) fn join_thread_until<T>(handle: JoinHandle<T>, deadline: Instant) -> Option<T> {
    loop {
        if handle.is_finished() {
            return handle.join().ok();
        }
        if Instant::now() >= deadline {
            tracing::debug!("Thread join timed out, abandoning thread");
            return None;
        }
        thread::sleep(Duration::from_millis(10));
    }
}
