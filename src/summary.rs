//! RSSI bookkeeping over a session CSV, and the hook that turns a finished
//! session into a report.
//!
//! The acquisition core only hands a CSV path to a [SessionReporter]; what
//! the reporter renders is its own business. [RonSummaryReporter] writes
//! the series and its statistics next to the other artifacts so a plotting
//! tool can pick them up.

use crate::csi_record::RSSI_COLUMN;
use chrono::NaiveDateTime;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::{
    borrow::Cow,
    fmt,
    fs::{self, File},
    path::{Path, PathBuf},
};

/// One accepted row of a session, reduced to what a chart needs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RssiPoint {
    /// Seconds since the first row.
    pub elapsed_seconds: f64,
    /// RSSI in dBm.
    pub rssi: f64,
    /// Mean of every RSSI up to and including this row.
    pub cumulative_mean: f64,
}

/// Coarse signal strength bands used to label a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalLevel {
    /// -30 dBm and up, a few centimetres to a metre.
    VeryStrong,
    /// -70 dBm and up, two to ten metres.
    Good,
    /// -90 dBm and up, ten to twenty metres.
    Weak,
    /// Anything lower, the link is about to drop.
    VeryWeak,
}

impl SignalLevel {
    /// Band of a mean RSSI.
    pub fn classify(rssi: f64) -> Self {
        if rssi >= -30.0 {
            SignalLevel::VeryStrong
        } else if rssi >= -70.0 {
            SignalLevel::Good
        } else if rssi >= -90.0 {
            SignalLevel::Weak
        } else {
            SignalLevel::VeryWeak
        }
    }

    /// The distance a band usually corresponds to.
    pub fn distance_hint(&self) -> &'static str {
        match self {
            SignalLevel::VeryStrong => "a few cm - 1 m",
            SignalLevel::Good => "2 - 10 m",
            SignalLevel::Weak => "10 - 20 m",
            SignalLevel::VeryWeak => "at the edge of the link",
        }
    }
}

/// Aggregate numbers of an [RssiSeries].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RssiStats {
    /// Rows with a usable RSSI.
    pub packets: usize,
    /// Mean RSSI.
    pub mean: f64,
    /// Lowest RSSI.
    pub min: f64,
    /// Highest RSSI.
    pub max: f64,
    /// Time between the first and last row.
    pub duration_seconds: f64,
    /// Rows per second over that time.
    pub rate: f64,
    /// Band of the mean.
    pub level: SignalLevel,
}

/// The RSSI column of a session CSV, in time order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RssiSeries {
    /// Every usable row.
    pub points: Vec<RssiPoint>,
}

impl RssiSeries {
    /// Read a session CSV. Rows whose timestamp or RSSI does not parse are
    /// skipped; a file without any usable row is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SummaryError> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path.as_ref())
            .map_err(SummaryError::CsvError)?;

        let mut samples = Vec::new();
        for (row_num, row) in reader.records().enumerate() {
            let row = match row {
                Ok(row) => row,
                Err(e) => {
                    debug!("Skipping row {}: {}", row_num, e);
                    continue;
                }
            };
            let timestamp = row
                .get(0)
                .and_then(|t| NaiveDateTime::parse_from_str(t, "%Y-%m-%dT%H:%M:%S%.f").ok());
            let rssi = row.get(RSSI_COLUMN).and_then(|r| r.trim().parse::<f64>().ok());
            match (timestamp, rssi) {
                (Some(t), Some(r)) => samples.push((t, r)),
                _ => debug!("Skipping row {}: {:?}", row_num, row),
            }
        }

        Self::from_samples(samples).ok_or(SummaryError::NoValidRows)
    }

    fn from_samples(samples: Vec<(NaiveDateTime, f64)>) -> Option<Self> {
        let start = samples.iter().map(|(t, _)| *t).min()?;
        let mut sum = 0.0;
        let points = samples
            .into_iter()
            .enumerate()
            .map(|(i, (t, rssi))| {
                sum += rssi;
                RssiPoint {
                    elapsed_seconds: (t - start).num_microseconds().unwrap_or(0) as f64 / 1e6,
                    rssi,
                    cumulative_mean: sum / (i + 1) as f64,
                }
            })
            .collect();
        Some(Self { points })
    }

    /// The most recent `n` points.
    pub fn tail(&self, n: usize) -> &[RssiPoint] {
        &self.points[self.points.len().saturating_sub(n)..]
    }

    /// Aggregate statistics.
    pub fn stats(&self) -> RssiStats {
        let packets = self.points.len();
        let mean = self
            .points
            .last()
            .map(|p| p.cumulative_mean)
            .unwrap_or(f64::NAN);
        let min = self.points.iter().map(|p| p.rssi).fold(f64::INFINITY, f64::min);
        let max = self
            .points
            .iter()
            .map(|p| p.rssi)
            .fold(f64::NEG_INFINITY, f64::max);
        let duration_seconds = self
            .points
            .iter()
            .map(|p| p.elapsed_seconds)
            .fold(0.0, f64::max);
        let rate = if duration_seconds > 0.0 {
            packets as f64 / duration_seconds
        } else {
            0.0
        };
        RssiStats {
            packets,
            mean,
            min,
            max,
            duration_seconds,
            rate,
            level: SignalLevel::classify(mean),
        }
    }
}

/// A session report as written by [RonSummaryReporter].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    /// The CSV the report was made from.
    pub csv_path: PathBuf,
    /// Aggregate numbers.
    pub stats: RssiStats,
    /// The full series.
    pub series: RssiSeries,
}

/// Turns a closed session CSV into some artifact, returning its path.
pub trait SessionReporter: Send + Sync {
    /// Produce the report for `csv_path`.
    fn report(&self, csv_path: &Path) -> Result<PathBuf, SummaryError>;
}

/// Writes `<csv stem>_summary.ron` into a directory.
#[derive(Debug, Clone)]
pub struct RonSummaryReporter {
    out_dir: PathBuf,
}

impl RonSummaryReporter {
    /// A reporter writing into `out_dir`, created on demand.
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }
}

impl SessionReporter for RonSummaryReporter {
    fn report(&self, csv_path: &Path) -> Result<PathBuf, SummaryError> {
        let series = RssiSeries::load(csv_path)?;
        let report = SessionReport {
            csv_path: csv_path.to_path_buf(),
            stats: series.stats(),
            series,
        };

        let stem = csv_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "session".to_owned());
        fs::create_dir_all(&self.out_dir).map_err(SummaryError::IoError)?;
        let out_path = self.out_dir.join(format!("{}_summary.ron", stem));

        let file = File::create(&out_path).map_err(SummaryError::IoError)?;
        ron::ser::to_writer_pretty(file, &report, ron::ser::PrettyConfig::default())
            .map_err(SummaryError::RonError)?;

        info!(
            "Summary written to {} ({} packets, mean {:.1} dBm)",
            out_path.display(),
            report.stats.packets,
            report.stats.mean
        );
        Ok(out_path)
    }
}

/// Everything that can go wrong while summarizing a session.
#[derive(Debug)]
pub enum SummaryError {
    /// Returned when the CSV has no row with a usable timestamp and RSSI.
    NoValidRows,
    /// Returned when reading or writing files fails.
    IoError(std::io::Error),
    /// Returned when the CSV cannot be opened or decoded.
    CsvError(csv::Error),
    /// Returned when the report cannot be serialized.
    RonError(ron::Error),
}

impl fmt::Display for SummaryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            SummaryError::NoValidRows => Cow::from("no valid rows in session file"),
            SummaryError::IoError(error) => Cow::from(format!("io error: {}", error)),
            SummaryError::CsvError(error) => Cow::from(format!("csv error: {}", error)),
            SummaryError::RonError(error) => Cow::from(format!("ron error: {}", error)),
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for SummaryError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csi_record::HEADER;
    use std::io::Write;

    fn write_session(dir: &Path, rows: &[(&str, &str)]) -> PathBuf {
        let path = dir.join("csi_2m_test.csv");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "{}", HEADER.join(",")).unwrap();
        for (ts, rssi) in rows {
            writeln!(f, "{},1,aa:bb:cc:dd:ee:ff,{},11,1,4,0,1,1,1,0,0,0,-97,1,1,2,30198,0,89,0,4,0,\"[1,2]\"", ts, rssi).unwrap();
        }
        path
    }

    #[test]
    fn series_and_stats() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_session(
            dir.path(),
            &[
                ("2024-05-01T10:00:00.000000", "-60"),
                ("2024-05-01T10:00:01.000000", "oops"),
                ("2024-05-01T10:00:01.500000", "-70"),
                ("2024-05-01T10:00:02.000000", "-80"),
            ],
        );

        let series = RssiSeries::load(&path).unwrap();
        assert_eq!(series.points.len(), 3);
        assert_eq!(series.points[1].elapsed_seconds, 1.5);
        assert_eq!(series.points[1].cumulative_mean, -65.0);
        assert_eq!(series.tail(1)[0].rssi, -80.0);
        assert_eq!(series.tail(10).len(), 3);

        let stats = series.stats();
        assert_eq!(stats.packets, 3);
        assert_eq!(stats.mean, -70.0);
        assert_eq!(stats.min, -80.0);
        assert_eq!(stats.max, -60.0);
        assert_eq!(stats.duration_seconds, 2.0);
        assert_eq!(stats.rate, 1.5);
        assert_eq!(stats.level, SignalLevel::Good);
    }

    #[test]
    fn empty_session_has_no_series() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_session(dir.path(), &[]);
        assert!(matches!(RssiSeries::load(&path), Err(SummaryError::NoValidRows)));
    }

    #[test]
    fn bands() {
        assert_eq!(SignalLevel::classify(-25.0), SignalLevel::VeryStrong);
        assert_eq!(SignalLevel::classify(-30.0), SignalLevel::VeryStrong);
        assert_eq!(SignalLevel::classify(-70.0), SignalLevel::Good);
        assert_eq!(SignalLevel::classify(-85.5), SignalLevel::Weak);
        assert_eq!(SignalLevel::classify(-91.0), SignalLevel::VeryWeak);
    }

    #[test]
    fn ron_reporter_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_session(dir.path(), &[("2024-05-01T10:00:00.000000", "-42")]);
        let reporter = RonSummaryReporter::new(dir.path().join("chart"));

        let out = reporter.report(&path).unwrap();
        assert_eq!(out, dir.path().join("chart").join("csi_2m_test_summary.ron"));

        let report: SessionReport = ron::de::from_reader(File::open(out).unwrap()).unwrap();
        assert_eq!(report.stats.packets, 1);
        assert_eq!(report.stats.level, SignalLevel::Good);
    }
}
