//! The single writer of session CSV files.
//!
//! Every read loop feeds [CsiCollector::add]; a mutex around the writer and
//! the counters makes each accepted line exactly one complete row, no matter
//! how many radios deliver at once.

use crate::command_channel::CommandChannel;
use crate::config::RssiPolicy;
use crate::csi_record::{host_timestamp, CsiPacket, HEADER, MARKER};
use crate::line_reader::LineSink;
use crate::summary::SessionReporter;
use log::{debug, info, warn};
use serde::Serialize;
use std::{
    borrow::Cow,
    fmt,
    fs::File,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::Instant,
};

/// Result of offering a line to the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// One row was written.
    Accepted,
    /// Nothing was written.
    Rejected(RejectReason),
}

/// Why a line was not written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// No session is open.
    Inactive,
    /// The line does not start with the packet marker.
    MissingMarker,
    /// The line has the marker but not the packet shape.
    Malformed,
    /// The row could not be written to disk.
    WriteFailed,
}

/// Running RSSI figures of the open session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RssiTracker {
    /// Live value, subject to the [RssiPolicy].
    pub current: Option<i32>,
    /// Rows with a parsable RSSI.
    pub samples: u64,
    /// Lowest RSSI seen.
    pub min: Option<i32>,
    /// Highest RSSI seen.
    pub max: Option<i32>,
    sum: i64,
}

impl RssiTracker {
    fn observe(&mut self, rssi: Option<i32>, policy: RssiPolicy) {
        match rssi {
            Some(value) => {
                self.current = Some(value);
                self.samples += 1;
                self.sum += value as i64;
                self.min = Some(self.min.map_or(value, |m| m.min(value)));
                self.max = Some(self.max.map_or(value, |m| m.max(value)));
            }
            None => {
                if policy == RssiPolicy::NullOnParseError {
                    self.current = None;
                }
            }
        }
    }

    /// Mean of every parsable RSSI.
    pub fn mean(&self) -> Option<f64> {
        if self.samples == 0 {
            None
        } else {
            Some(self.sum as f64 / self.samples as f64)
        }
    }
}

/// A snapshot of the collector for status queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectorStatus {
    /// Whether a session file is open.
    pub active: bool,
    /// Rows written in the current session.
    pub packet_count: u64,
    /// Seconds since the session opened.
    pub elapsed_seconds: f64,
    /// Rows per second.
    pub rate: f64,
    /// The open session file.
    pub csv_path: Option<PathBuf>,
    /// RSSI figures.
    pub rssi: RssiTracker,
}

/// What a closed session produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CsiSessionResult {
    /// Rows written.
    pub packet_count: u64,
    /// Seconds the session was open.
    pub elapsed_seconds: f64,
    /// The session file.
    pub csv_path: PathBuf,
    /// The reporter's artifact, if one was made.
    pub chart_path: Option<PathBuf>,
}

struct OpenSession {
    writer: csv::Writer<File>,
    path: PathBuf,
    started: Instant,
    packet_count: u64,
    rssi: RssiTracker,
}

/// Parses packet lines and appends them to the session CSV.
pub struct CsiCollector {
    session: Mutex<Option<OpenSession>>,
    commands: Option<Arc<CommandChannel>>,
    reporter: Option<Arc<dyn SessionReporter>>,
    policy: RssiPolicy,
}

impl CsiCollector {
    /// A collector that arms radios through `commands` and reports through
    /// `reporter`. Either may be absent.
    pub fn new(
        commands: Option<Arc<CommandChannel>>,
        reporter: Option<Arc<dyn SessionReporter>>,
        policy: RssiPolicy,
    ) -> Self {
        Self {
            session: Mutex::new(None),
            commands,
            reporter,
            policy,
        }
    }

    /// Open `path`, write the header, and ask the radios to start streaming.
    /// Streaming is best effort: a radio that does not answer does not fail
    /// the start.
    pub fn start(&self, path: impl AsRef<Path>) -> Result<(), CollectorError> {
        let path = path.as_ref().to_path_buf();
        {
            let mut session = self.lock();
            if session.is_some() {
                return Err(CollectorError::AlreadyActive);
            }

            let mut writer = csv::Writer::from_path(&path).map_err(CollectorError::CsvError)?;
            writer.write_record(HEADER).map_err(CollectorError::CsvError)?;
            writer.flush().map_err(CollectorError::IoError)?;

            *session = Some(OpenSession {
                writer,
                path: path.clone(),
                started: Instant::now(),
                packet_count: 0,
                rssi: RssiTracker::default(),
            });
        }
        info!("Collecting CSI into {}", path.display());

        if let Some(commands) = &self.commands {
            if !commands.arm() {
                warn!("No radio accepted the streaming commands");
            }
        }
        Ok(())
    }

    /// Offer one line. Accepted lines become exactly one flushed row.
    pub fn add(&self, line: &str) -> AddOutcome {
        let mut guard = self.lock();
        let Some(session) = guard.as_mut() else {
            return AddOutcome::Rejected(RejectReason::Inactive);
        };
        if !line.starts_with(MARKER) {
            return AddOutcome::Rejected(RejectReason::MissingMarker);
        }
        let packet = match line.parse::<CsiPacket>() {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Dropping malformed line: {:?}", e.code);
                return AddOutcome::Rejected(RejectReason::Malformed);
            }
        };

        let rssi = packet.rssi();
        let record = packet.stamp(host_timestamp());
        let written = session
            .writer
            .write_record(record.to_row())
            .map_err(CollectorError::CsvError)
            .and_then(|_| session.writer.flush().map_err(CollectorError::IoError));
        if let Err(e) = written {
            warn!("Failed to write to {}: {}", session.path.display(), e);
            return AddOutcome::Rejected(RejectReason::WriteFailed);
        }

        session.packet_count += 1;
        session.rssi.observe(rssi, self.policy);
        if session.packet_count % 500 == 0 {
            let elapsed = session.started.elapsed().as_secs_f64();
            debug!(
                "{} packets, {:.1} pkt/s",
                session.packet_count,
                session.packet_count as f64 / elapsed.max(f64::EPSILON)
            );
        }
        AddOutcome::Accepted
    }

    /// Close the session. Returns `None` if none was open. Otherwise the
    /// radios are told to stop, the file is closed, and if anything was
    /// written the reporter runs; a reporter failure only loses the chart.
    pub fn stop(&self) -> Option<CsiSessionResult> {
        let mut session = self.lock().take()?;

        if let Some(commands) = &self.commands {
            commands.disarm();
        }
        if let Err(e) = session.writer.flush() {
            warn!("Failed to flush {}: {}", session.path.display(), e);
        }
        let elapsed_seconds = session.started.elapsed().as_secs_f64();
        let OpenSession {
            path, packet_count, ..
        } = session;

        info!(
            "Collection stopped: {} packets in {:.1}s, {}",
            packet_count,
            elapsed_seconds,
            path.display()
        );

        let chart_path = match (&self.reporter, packet_count) {
            (Some(reporter), n) if n > 0 => match reporter.report(&path) {
                Ok(chart) => Some(chart),
                Err(e) => {
                    warn!("Report for {} failed: {}", path.display(), e);
                    None
                }
            },
            _ => None,
        };

        Some(CsiSessionResult {
            packet_count,
            elapsed_seconds,
            csv_path: path,
            chart_path,
        })
    }

    /// Whether a session is open.
    pub fn is_active(&self) -> bool {
        self.lock().is_some()
    }

    /// Current figures.
    pub fn status(&self) -> CollectorStatus {
        match self.lock().as_ref() {
            Some(session) => {
                let elapsed = session.started.elapsed().as_secs_f64();
                CollectorStatus {
                    active: true,
                    packet_count: session.packet_count,
                    elapsed_seconds: elapsed,
                    rate: if elapsed > 0.0 {
                        session.packet_count as f64 / elapsed
                    } else {
                        0.0
                    },
                    csv_path: Some(session.path.clone()),
                    rssi: session.rssi,
                }
            }
            None => CollectorStatus {
                active: false,
                packet_count: 0,
                elapsed_seconds: 0.0,
                rate: 0.0,
                csv_path: None,
                rssi: RssiTracker::default(),
            },
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<OpenSession>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl LineSink for CsiCollector {
    fn accept_line(&self, line: &str) -> bool {
        self.add(line) == AddOutcome::Accepted
    }
}

/// Everything that can go wrong while opening a session file.
#[derive(Debug)]
pub enum CollectorError {
    /// A session is already open.
    AlreadyActive,
    /// Returned when io fails while writing.
    IoError(std::io::Error),
    /// Returned when the file cannot be created or a row cannot be encoded.
    CsvError(csv::Error),
}

impl fmt::Display for CollectorError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            CollectorError::AlreadyActive => Cow::from("collection already active"),
            CollectorError::IoError(error) => Cow::from(format!("io error: {}", error)),
            CollectorError::CsvError(error) => Cow::from(format!("csv error: {}", error)),
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for CollectorError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, thread};

    fn line(id: u32, rssi: &str) -> String {
        format!(
            "CSI_DATA,{},aa:bb:cc:dd:ee:ff,{},11,1,4,0,1,1,1,0,0,0,-97,1,1,2,30198,0,89,0,4,0,[1,-2,3,4]",
            id, rssi
        )
    }

    fn rows(path: &Path) -> Vec<csv::StringRecord> {
        csv::Reader::from_path(path)
            .unwrap()
            .records()
            .map(|r| r.unwrap())
            .collect()
    }

    fn collector() -> CsiCollector {
        CsiCollector::new(None, None, RssiPolicy::KeepLast)
    }

    #[test]
    fn two_packets_update_count_and_rssi() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.csv");
        let c = collector();
        c.start(&path).unwrap();

        assert_eq!(c.add(&line(1, "-65")), AddOutcome::Accepted);
        assert_eq!(c.add(&line(2, "-70")), AddOutcome::Accepted);

        let status = c.status();
        assert_eq!(status.packet_count, 2);
        assert_eq!(status.rssi.current, Some(-70));
        assert_eq!(status.rssi.mean(), Some(-67.5));

        let result = c.stop().unwrap();
        assert_eq!(result.packet_count, 2);
        assert_eq!(result.chart_path, None);

        let written = rows(&path);
        assert_eq!(written.len(), 2);
        for row in &written {
            assert_eq!(row.len(), HEADER.len());
        }
        assert_eq!(&written[1][3], "-70");
        assert_eq!(&written[0][24], "[1,-2,3,4]");
    }

    #[test]
    fn header_is_written_on_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.csv");
        let c = collector();
        c.start(&path).unwrap();
        let headers = csv::Reader::from_path(&path).unwrap().headers().unwrap().clone();
        assert_eq!(headers.iter().collect::<Vec<_>>(), HEADER.to_vec());
    }

    #[test]
    fn rejected_lines_write_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.csv");
        let c = collector();

        assert_eq!(c.add(&line(1, "-65")), AddOutcome::Rejected(RejectReason::Inactive));

        c.start(&path).unwrap();
        assert_eq!(
            c.add(&line(1, "-65")[MARKER.len()..]),
            AddOutcome::Rejected(RejectReason::MissingMarker)
        );
        assert_eq!(
            c.add("CSI_DATA,1,aa:bb:cc:dd:ee:ff,-65,11,1,4"),
            AddOutcome::Rejected(RejectReason::Malformed)
        );
        assert_eq!(c.status().packet_count, 0);
        c.stop();
        assert!(rows(&path).is_empty());
    }

    #[test]
    fn bad_rssi_keeps_last_value_and_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.csv");
        let c = collector();
        c.start(&path).unwrap();
        c.add(&line(1, "-65"));
        assert_eq!(c.add(&line(2, "garbage")), AddOutcome::Accepted);
        assert_eq!(c.status().rssi.current, Some(-65));
        assert_eq!(c.status().packet_count, 2);
        c.stop();
        assert_eq!(&rows(&path)[1][3], "garbage");
    }

    #[test]
    fn bad_rssi_clears_value_under_null_policy() {
        let dir = tempfile::tempdir().unwrap();
        let c = CsiCollector::new(None, None, RssiPolicy::NullOnParseError);
        c.start(dir.path().join("s.csv")).unwrap();
        c.add(&line(1, "-65"));
        c.add(&line(2, "garbage"));
        assert_eq!(c.status().rssi.current, None);
        assert_eq!(c.status().rssi.samples, 1);
    }

    #[test]
    fn stop_is_idempotent_and_start_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("a.csv");
        let c = collector();
        c.start(&first).unwrap();
        c.add(&line(1, "-65"));

        assert!(matches!(
            c.start(dir.path().join("b.csv")),
            Err(CollectorError::AlreadyActive)
        ));
        assert!(!dir.path().join("b.csv").exists());

        assert!(c.stop().is_some());
        assert!(c.stop().is_none());
        assert_eq!(rows(&first).len(), 1);
    }

    #[test]
    fn unwritable_path_fails_start() {
        let dir = tempfile::tempdir().unwrap();
        let c = collector();
        assert!(c.start(dir.path().join("missing").join("s.csv")).is_err());
        assert!(!c.is_active());
    }

    #[test]
    fn concurrent_writers_make_whole_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.csv");
        let c = Arc::new(collector());
        c.start(&path).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let c = c.clone();
                thread::spawn(move || {
                    for i in 0..250 {
                        assert_eq!(c.add(&line(t * 1000 + i, "-50")), AddOutcome::Accepted);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(c.stop().unwrap().packet_count, 1000);
        let written = rows(&path);
        assert_eq!(written.len(), 1000);
        assert!(written.iter().all(|r| r.len() == HEADER.len()));
    }

    struct FailingReporter;

    impl SessionReporter for FailingReporter {
        fn report(&self, _: &Path) -> Result<PathBuf, crate::summary::SummaryError> {
            Err(crate::summary::SummaryError::NoValidRows)
        }
    }

    #[test]
    fn reporter_runs_only_with_data_and_may_fail() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = Arc::new(crate::summary::RonSummaryReporter::new(dir.path().join("chart")));
        let c = CsiCollector::new(None, Some(reporter), RssiPolicy::KeepLast);

        c.start(dir.path().join("empty.csv")).unwrap();
        assert_eq!(c.stop().unwrap().chart_path, None);

        c.start(dir.path().join("full.csv")).unwrap();
        c.add(&line(1, "-65"));
        let chart = c.stop().unwrap().chart_path.unwrap();
        assert!(fs::metadata(chart).is_ok());

        let c = CsiCollector::new(None, Some(Arc::new(FailingReporter)), RssiPolicy::KeepLast);
        c.start(dir.path().join("again.csv")).unwrap();
        c.add(&line(1, "-65"));
        let result = c.stop().unwrap();
        assert_eq!(result.packet_count, 1);
        assert_eq!(result.chart_path, None);
    }
}
