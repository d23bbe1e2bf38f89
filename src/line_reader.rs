//! One read loop per radio. Each loop drains its link, cuts the byte stream
//! into lines, and hands packet lines to a [LineSink].

use crate::config::ReaderConfig;
use crate::connection_manager::DeviceConnection;
use crate::csi_record::MARKER;
use log::{debug, info, warn};
use std::{
    io::{self, ErrorKind},
    sync::{atomic::Ordering, Arc},
    thread::{self, sleep, JoinHandle},
    time::{Duration, Instant},
};

/// Longest line kept before the buffer is thrown away. Real packet lines are
/// a few kilobytes; anything longer is a stream without newlines.
const MAX_LINE_LEN: usize = 64 * 1024;

/// Where packet lines go.
pub trait LineSink: Send + Sync {
    /// Take one packet line. Returns whether it was accepted.
    fn accept_line(&self, line: &str) -> bool;
}

/// Cuts a byte stream into text lines.
///
/// Invalid UTF-8 is dropped rather than replaced, surrounding whitespace is
/// trimmed, and empty lines are skipped.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: Vec<u8>,
    overflowed: bool,
}

impl LineSplitter {
    /// An empty splitter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes in, get back every line they completed.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &c in bytes {
            if c == b'\n' {
                if !self.overflowed {
                    let line = decode_lossy(&self.buf);
                    let line = line.trim();
                    if !line.is_empty() {
                        lines.push(line.to_owned());
                    }
                }
                self.buf.clear();
                self.overflowed = false;
            } else if self.overflowed {
                continue;
            } else if self.buf.len() < MAX_LINE_LEN {
                self.buf.push(c);
            } else {
                warn!("Discarding {} bytes without a newline", self.buf.len());
                self.buf.clear();
                self.overflowed = true;
            }
        }
        lines
    }
}

fn decode_lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).replace(char::REPLACEMENT_CHARACTER, "")
}

/// A running read loop.
pub struct LineReader {
    connection: DeviceConnection,
    handle: JoinHandle<ReaderReport>,
}

/// What a read loop did before it exited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReaderReport {
    /// Lines carrying the packet marker.
    pub packet_lines: u64,
    /// Of those, lines the sink accepted.
    pub accepted: u64,
    /// Lines without the marker.
    pub other_lines: u64,
    /// True if the loop ended because the device kept failing.
    pub device_lost: bool,
}

impl LineReader {
    /// Start the read loop of `connection`, forwarding to `sink`. Fails with
    /// [ErrorKind::AlreadyExists] while a loop from an earlier session is
    /// still draining the same link.
    pub fn spawn(
        connection: DeviceConnection,
        sink: Arc<dyn LineSink>,
        config: &ReaderConfig,
    ) -> io::Result<Self> {
        if !connection.claim_reader() {
            return Err(io::Error::new(
                ErrorKind::AlreadyExists,
                format!("{} still has a read loop running", connection.port()),
            ));
        }
        connection.listening_flag().store(true, Ordering::SeqCst);

        let th_connection = connection.clone();
        let idle = Duration::from_millis(config.idle_yield_ms);
        let max_failures = config.max_read_failures.max(1);
        let handle = thread::Builder::new()
            .name(format!("reader {}", connection.port()))
            .spawn(move || {
                let claim = ReaderClaim(th_connection);
                read_loop(&claim.0, sink, idle, max_failures)
            })
            .map_err(|e| {
                connection.request_stop();
                connection.release_reader();
                e
            })?;

        info!("Reading CSI from {}", connection.port());
        Ok(Self { connection, handle })
    }

    /// The device this loop reads from.
    pub fn port(&self) -> &str {
        self.connection.port()
    }

    /// Ask the loop to exit without waiting for it.
    pub fn request_stop(&self) {
        self.connection.request_stop();
    }

    /// Ask the loop to exit and wait up to `timeout`. Returns the report if
    /// the loop ended in time, `None` if it is still running (it is then
    /// left to finish on its own).
    pub fn stop(self, timeout: Duration) -> Option<ReaderReport> {
        self.request_stop();
        let deadline = Instant::now() + timeout;
        while !self.handle.is_finished() {
            if Instant::now() >= deadline {
                warn!("Reader for {} did not stop within {:?}", self.port(), timeout);
                return None;
            }
            sleep(Duration::from_millis(1));
        }
        match self.handle.join() {
            Ok(report) => Some(report),
            Err(_) => {
                warn!("Reader for {} panicked", self.connection.port());
                Some(ReaderReport::default())
            }
        }
    }
}

/// Frees the read-loop slot of a device when its loop exits, panics included.
struct ReaderClaim(DeviceConnection);

impl Drop for ReaderClaim {
    fn drop(&mut self) {
        self.0.release_reader();
    }
}

fn read_loop(
    connection: &DeviceConnection,
    sink: Arc<dyn LineSink>,
    idle: Duration,
    max_failures: u32,
) -> ReaderReport {
    let flag = connection.listening_flag();
    let mut splitter = LineSplitter::new();
    let mut report = ReaderReport::default();
    let mut buffer = [0u8; 4096];
    let mut failures = 0;

    while flag.load(Ordering::SeqCst) {
        // Drain everything that is buffered before yielding.
        loop {
            match connection.link().read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    failures = 0;
                    for line in splitter.push(&buffer[..n]) {
                        if line.starts_with(MARKER) {
                            report.packet_lines += 1;
                            if sink.accept_line(&line) {
                                report.accepted += 1;
                            }
                        } else {
                            report.other_lines += 1;
                            debug!("{}: {}", connection.port(), line);
                        }
                    }
                    if !flag.load(Ordering::SeqCst) {
                        break;
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    failures += 1;
                    warn!("Error reading from {}: {}", connection.port(), e);
                    if failures >= max_failures {
                        warn!("Giving up on {}", connection.port());
                        connection.mark_dead();
                        flag.store(false, Ordering::SeqCst);
                        report.device_lost = true;
                        return report;
                    }
                    break;
                }
            }
        }
        sleep(idle);
    }

    info!(
        "Reader for {} stopped after {} packet lines",
        connection.port(),
        report.packet_lines
    );
    report
}
