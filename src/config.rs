//! Runtime configuration for the recorder.
//!
//! Every field has a default, so a configuration file only needs to mention
//! what it changes. Files are written in [ron], the same way the rest of the
//! crate serializes structured data:
//!
//! ```text
//! (
//!     data_dir: "data",
//!     serial: (baud_rate: 921600),
//!     video: (stream_url: "http://192.168.1.20:8080/video", fps: 30.0),
//!     rssi_policy: NullOnParseError,
//! )
//! ```

use serde::{Deserialize, Serialize};
use std::{
    borrow::Cow,
    fmt, fs,
    path::{Path, PathBuf},
    time::Duration,
};

const DEFAULT_CAMERA_IP: &str = "172.20.10.11";
const DEFAULT_CAMERA_PORT: &str = "8080";

/// The top level configuration tree.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Root of the on-disk artifact layout, see [Config::csi_dir] and friends.
    pub data_dir: PathBuf,
    /// Serial port settings shared by every radio.
    pub serial: SerialConfig,
    /// The ASCII command codes understood by the radio firmware.
    pub commands: CommandSet,
    /// How hard to try for an acknowledgement after arming a radio.
    pub ack: AckPolicy,
    /// Read loop settings.
    pub reader: ReaderConfig,
    /// Camera settings.
    pub video: VideoConfig,
    /// What happens to the live RSSI when a row carries an unparsable value.
    pub rssi_policy: RssiPolicy,
    /// Case-insensitive substrings that identify a compatible radio, matched
    /// against a port's description and its `vid:pid` string.
    pub device_keywords: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            serial: SerialConfig::default(),
            commands: CommandSet::default(),
            ack: AckPolicy::default(),
            reader: ReaderConfig::default(),
            video: VideoConfig::default(),
            rssi_policy: RssiPolicy::default(),
            device_keywords: [
                "esp32",
                "cp210",
                "ch340",
                "cp2102",
                "ft232",
                "silicon labs",
                "1a86:7523",
                "10c4:ea60",
                "0403:6001",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl Config {
    /// Read a [Config] from a RON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(ConfigError::IoError)?;
        Self::from_ron(&text)
    }

    /// Parse a [Config] from RON text.
    pub fn from_ron(text: &str) -> Result<Self, ConfigError> {
        ron::de::from_str(text).map_err(ConfigError::RonSpannedError)
    }

    /// Session CSV files.
    pub fn csi_dir(&self) -> PathBuf {
        self.data_dir.join("csi")
    }

    /// Reporter output.
    pub fn chart_dir(&self) -> PathBuf {
        self.data_dir.join("chart")
    }

    /// Video containers.
    pub fn video_dir(&self) -> PathBuf {
        self.data_dir.join("video")
    }

    /// Still frames, one sub-directory per video.
    pub fn image_dir(&self) -> PathBuf {
        self.data_dir.join("images")
    }

    /// Create the whole directory layout.
    pub fn create_directories(&self) -> std::io::Result<()> {
        for dir in [
            self.csi_dir(),
            self.chart_dir(),
            self.video_dir(),
            self.image_dir(),
        ] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// `dir/stem.ext`, or the first of `dir/stem_2.ext`, `dir/stem_3.ext`, ...
/// that does not exist yet. Artifact names only have second resolution.
pub fn unused_path(dir: &Path, stem: &str, ext: &str) -> PathBuf {
    let mut path = dir.join(format!("{}.{}", stem, ext));
    let mut n = 2;
    while path.exists() {
        path = dir.join(format!("{}_{}.{}", stem, n, ext));
        n += 1;
    }
    path
}

/// Serial link parameters.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Line speed for every radio.
    pub baud_rate: u32,
    /// Read timeout; also the worst-case latency of a reader stop request.
    pub read_timeout_ms: u64,
    /// Pause after opening a port, long enough for a bootloader reset.
    pub settle_delay_ms: u64,
    /// Pause after the wake-up newline.
    pub probe_delay_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115200,
            read_timeout_ms: 100,
            settle_delay_ms: 2000,
            probe_delay_ms: 500,
        }
    }
}

impl SerialConfig {
    /// [SerialConfig::read_timeout_ms] as a [Duration].
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// [SerialConfig::settle_delay_ms] as a [Duration].
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// [SerialConfig::probe_delay_ms] as a [Duration].
    pub fn probe_delay(&self) -> Duration {
        Duration::from_millis(self.probe_delay_ms)
    }
}

/// Firmware command codes. Each one is sent followed by a newline.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CommandSet {
    /// Switches the radio to raw CSI output over serial.
    pub serial_mode: String,
    /// Starts CSI capture.
    pub start_listen: String,
    /// Stops CSI capture.
    pub stop_listen: String,
    /// Text the radio prints once serial mode is on.
    pub serial_mode_ack: String,
}

impl Default for CommandSet {
    fn default() -> Self {
        Self {
            serial_mode: "6".to_owned(),
            start_listen: "1".to_owned(),
            stop_listen: "stop_listen".to_owned(),
            serial_mode_ack: "Serial Data output: ON".to_owned(),
        }
    }
}

/// Bounds on the acknowledgement probe that follows the serial-mode command.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct AckPolicy {
    /// How many times the command is re-sent.
    pub attempts: u32,
    /// Pause between sending and the first check.
    pub settle_ms: u64,
    /// Checks per attempt.
    pub checks: u32,
    /// Pause between checks.
    pub check_interval_ms: u64,
    /// Pause after an attempt that did not see the acknowledgement.
    pub retry_delay_ms: u64,
}

impl Default for AckPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            settle_ms: 2000,
            checks: 10,
            check_interval_ms: 200,
            retry_delay_ms: 1000,
        }
    }
}

impl AckPolicy {
    /// A policy that makes one attempt without sleeping, handy for tests and
    /// simulated radios.
    pub fn immediate(checks: u32) -> Self {
        Self {
            attempts: 1,
            settle_ms: 0,
            checks,
            check_interval_ms: 0,
            retry_delay_ms: 0,
        }
    }
}

/// Per-device read loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Consecutive non-timeout read errors before a device is given up on.
    pub max_read_failures: u32,
    /// Pause between drain cycles.
    pub idle_yield_ms: u64,
    /// How long the controller waits for the readers to exit.
    pub stop_timeout_ms: u64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            max_read_failures: 3,
            idle_yield_ms: 1,
            stop_timeout_ms: 1000,
        }
    }
}

/// Camera and recording settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct VideoConfig {
    /// When false the session runs CSI only.
    pub enabled: bool,
    /// MJPEG stream to record from.
    pub stream_url: String,
    /// Target frame rate of the capture loop.
    pub fps: f64,
    /// Upper bound on waiting for the capture loop to exit.
    pub stop_timeout_ms: u64,
    /// Connect timeout for the camera stream.
    pub connect_timeout_ms: u64,
}

impl Default for VideoConfig {
    fn default() -> Self {
        let ip = std::env::var("EXPO_PUBLIC_CAMERA_IP")
            .unwrap_or_else(|_| DEFAULT_CAMERA_IP.to_owned());
        let port = std::env::var("EXPO_PUBLIC_CAMERA_PORT")
            .unwrap_or_else(|_| DEFAULT_CAMERA_PORT.to_owned());
        Self {
            enabled: true,
            stream_url: format!("http://{ip}:{port}/video"),
            fps: 25.0,
            stop_timeout_ms: 5000,
            connect_timeout_ms: 5000,
        }
    }
}

/// Policy for the live RSSI value when the RSSI column of an otherwise valid
/// row does not parse. The row is persisted either way.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum RssiPolicy {
    /// Keep the last value that did parse.
    #[default]
    KeepLast,
    /// Clear the live value until a parsable row arrives.
    NullOnParseError,
}

/// Everything that can go wrong while loading a [Config].
#[derive(Debug)]
pub enum ConfigError {
    /// The file could not be read.
    IoError(std::io::Error),
    /// The file is not valid RON for a [Config].
    RonSpannedError(ron::de::SpannedError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            ConfigError::IoError(error) => Cow::from(format!("io error: {}", error)),
            ConfigError::RonSpannedError(error) => Cow::from(format!("ron error: {}", error)),
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg = Config::from_ron(
            "(data_dir: \"/tmp/x\", serial: (baud_rate: 921600), rssi_policy: NullOnParseError)",
        )
        .unwrap();

        assert_eq!(cfg.data_dir, PathBuf::from("/tmp/x"));
        assert_eq!(cfg.serial.baud_rate, 921600);
        assert_eq!(cfg.serial.read_timeout_ms, 100);
        assert_eq!(cfg.rssi_policy, RssiPolicy::NullOnParseError);
        assert_eq!(cfg.commands, CommandSet::default());
        assert_eq!(cfg.csi_dir(), PathBuf::from("/tmp/x/csi"));
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(matches!(
            Config::from_ron("(serial: 12"),
            Err(ConfigError::RonSpannedError(_))
        ));
    }

    #[test]
    fn directories_are_created() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            data_dir: dir.path().join("data"),
            ..Config::default()
        };
        cfg.create_directories().unwrap();
        for sub in ["csi", "chart", "video", "images"] {
            assert!(dir.path().join("data").join(sub).is_dir());
        }
    }

    #[test]
    fn taken_names_get_a_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let first = unused_path(dir.path(), "csi_2m_20240501_100000", "csv");
        assert_eq!(first, dir.path().join("csi_2m_20240501_100000.csv"));
        fs::write(&first, "").unwrap();
        assert_eq!(
            unused_path(dir.path(), "csi_2m_20240501_100000", "csv"),
            dir.path().join("csi_2m_20240501_100000_2.csv")
        );
    }
}
