// Commandline argument parser using clap for csi-recorder

use clap::{Args, Parser, Subcommand};
use std::{path::PathBuf, time::Duration};

#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct CsiArgs {
    #[command(subcommand, long_about)]
    /// Which task to perform
    pub command: CommandTask,

    /// RON configuration file; every field is optional
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Root directory for csi/, chart/, video/ and images/
    #[arg(short = 'd', long = "data-dir")]
    pub data_dir: Option<PathBuf>,

    /// Use this many simulated radios instead of real serial ports
    #[arg(long = "simulate", value_name = "N")]
    pub simulate: Option<usize>,

    /// Log more; repeat for debug output
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Debug, Subcommand, Clone)]
pub enum CommandTask {
    /// List compatible serial ports without opening them
    #[command(about)]
    Scan,

    /// Record one session until a key is pressed
    #[command(about)]
    Record(RecordCommand),

    /// Send a raw command to every radio
    #[command(about)]
    Send(SendCommand),

    /// Grab a single frame from the camera
    #[command(about)]
    CameraTest(CameraCommand),

    /// Print the RSSI statistics of a session CSV
    #[command(about)]
    Summarize(SummarizeCommand),
}

#[derive(Debug, Args, Clone)]
#[command(about)]
pub struct RecordCommand {
    /// Distance tag put into every file name, in metres
    #[arg(short = 'l', long = "label")]
    pub label: String,

    /// Stop on its own after this many seconds
    #[arg(short = 't', long = "duration", value_parser = parse_seconds)]
    pub duration: Option<Duration>,

    /// Record CSI only
    #[arg(long = "no-video")]
    pub no_video: bool,

    /// Camera stream to record from
    #[arg(long = "camera-url")]
    pub camera_url: Option<String>,

    /// Wait for Enter instead of showing the live monitor
    #[arg(long = "headless")]
    pub headless: bool,
}

#[derive(Debug, Args, Clone)]
#[command(about)]
pub struct SendCommand {
    /// Command code, sent followed by a newline
    pub code: String,
}

#[derive(Debug, Args, Clone)]
#[command(about)]
pub struct CameraCommand {
    /// Camera stream to probe
    #[arg(long = "camera-url")]
    pub camera_url: Option<String>,
}

#[derive(Debug, Args, Clone)]
#[command(about)]
pub struct SummarizeCommand {
    /// Session CSV to read
    pub csv: PathBuf,
}

/// Seconds as a positive, finite decimal number.
fn parse_seconds(s: &str) -> Result<Duration, String> {
    let secs: f64 = s.parse().map_err(|e| format!("{}", e))?;
    match Duration::try_from_secs_f64(secs) {
        Ok(d) if !d.is_zero() => Ok(d),
        Ok(_) => Err("must be greater than zero".to_owned()),
        Err(e) => Err(format!("{}", e)),
    }
}
