//! Command line front end: scan for radios, record sessions, poke the
//! firmware, test the camera, and summarize finished sessions.

use clap::Parser;
use csi_recorder::{
    args::{CommandTask, CsiArgs, RecordCommand},
    command_channel::CommandChannel,
    config::{AckPolicy, Config},
    connection_manager::ConnectionManager,
    device::{KeywordClassifier, SerialBackend, SystemSerial},
    dummy_radio::DummyBackend,
    gui::monitor_session,
    session::{SessionController, SessionEvent, StartRequest},
    summary::{RonSummaryReporter, RssiSeries, SessionReporter},
    video::{HttpCamera, VideoRecorder},
};
use log::{error, info};
use ron::ser::PrettyConfig;
use std::{error::Error, io, process::ExitCode, sync::Arc, thread, time::Duration};

// Example:
// cargo run -- --simulate 2 record --label 1.5 --no-video --headless

fn main() -> ExitCode {
    let args = CsiArgs::parse();
    let default_level = match args.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: CsiArgs) -> Result<(), Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    };
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }

    let backend: Box<dyn SerialBackend> = match args.simulate {
        Some(n) => {
            info!("Simulating {} radio(s)", n);
            // Simulated radios have no bootloader to wait for.
            config.serial.settle_delay_ms = 0;
            config.serial.probe_delay_ms = 0;
            config.ack = AckPolicy::immediate(20);
            Box::new(DummyBackend::new(n))
        }
        None => Box::new(SystemSerial),
    };
    let devices = Arc::new(ConnectionManager::new(
        backend,
        Box::new(KeywordClassifier::new(config.device_keywords.clone())),
        config.serial.clone(),
    ));

    match args.command {
        CommandTask::Scan => {
            let ports = devices.scan();
            if ports.is_empty() {
                println!("No compatible radio found");
            }
            for port in ports {
                println!("{}\t{}\t{}", port.name, port.vid_pid(), port.description);
            }
        }
        CommandTask::Send(send) => {
            devices.discover();
            let channel = CommandChannel::new(devices.clone(), config.commands, config.ack);
            if !channel.send(&send.code) {
                return Err("no device accepted the command".into());
            }
            println!("Sent '{}' to {}", send.code, devices.connected().join(", "));
            devices.disconnect_all();
        }
        CommandTask::CameraTest(camera) => {
            let recorder = video_recorder(&config);
            if let Some(url) = camera.camera_url {
                recorder.set_stream_url(url);
            }
            let (path, (width, height)) = recorder.probe()?;
            println!("{}x{} frame saved to {}", width, height, path.display());
        }
        CommandTask::Summarize(summarize) => {
            let stats = RssiSeries::load(&summarize.csv)?.stats();
            println!("{}", ron::ser::to_string_pretty(&stats, PrettyConfig::default())?);
        }
        CommandTask::Record(record) => record_session(config, devices, record)?,
    }
    Ok(())
}

fn video_recorder(config: &Config) -> VideoRecorder {
    let camera = HttpCamera::new(Duration::from_millis(config.video.connect_timeout_ms));
    VideoRecorder::new(
        config.video.clone(),
        config.video_dir(),
        config.image_dir(),
        Arc::new(camera),
    )
}

fn record_session(
    config: Config,
    devices: Arc<ConnectionManager>,
    record: RecordCommand,
) -> Result<(), Box<dyn Error>> {
    devices.discover();
    let commands = Arc::new(CommandChannel::new(
        devices,
        config.commands.clone(),
        config.ack.clone(),
    ));
    let reporter: Arc<dyn SessionReporter> = Arc::new(RonSummaryReporter::new(config.chart_dir()));
    let video = if config.video.enabled && !record.no_video {
        let recorder = Arc::new(video_recorder(&config));
        if let Some(url) = record.camera_url {
            recorder.set_stream_url(url);
        }
        Some(recorder)
    } else {
        None
    };
    let controller = Arc::new(SessionController::new(
        config,
        commands,
        Some(reporter),
        video,
    ));

    let events = controller.subscribe();
    let started = controller.start(StartRequest {
        label: record.label,
        duration: record.duration,
        video: true,
    })?;
    println!("Recording CSI to {}", started.csv_path.display());
    if let Some(video_path) = &started.video_path {
        println!("Recording video to {}", video_path.display());
    }

    if record.headless {
        println!("Press Enter to stop");
        let stopper = controller.clone();
        thread::spawn(move || {
            let mut line = String::new();
            let _ = io::stdin().read_line(&mut line);
            stopper.stop();
        });
    } else {
        let shown = monitor_session(&controller);
        controller.stop();
        shown?;
    }

    let summary = loop {
        if let SessionEvent::Closed(summary) = events.recv()? {
            break summary;
        }
    };
    println!("{}", ron::ser::to_string_pretty(&summary, PrettyConfig::default())?);
    controller.devices().disconnect_all();
    Ok(())
}
