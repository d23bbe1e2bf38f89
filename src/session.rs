//! The session state machine.
//!
//! A [SessionController] owns the one collection run that may be active at a
//! time. Transitions go Idle → Starting → Active → Stopping → Idle under a
//! single mutex, and every failure while starting rolls back to Idle after
//! releasing whatever was already opened.
//!
//! Presentation layers learn about session boundaries through
//! [SessionController::subscribe] instead of being called from the stop path.

use crate::collector::{CollectorError, CsiCollector, CsiSessionResult, RssiTracker};
use crate::command_channel::CommandChannel;
use crate::config::{unused_path, Config};
use crate::connection_manager::ConnectionManager;
use crate::line_reader::{LineReader, LineSink};
use crate::summary::{RssiPoint, RssiSeries, SessionReporter};
use crate::video::{VideoRecorder, VideoSessionResult};
use chrono::Local;
use log::{debug, info, warn};
use serde::Serialize;
use std::{
    borrow::Cow,
    fmt, fs,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc, Arc, Mutex, MutexGuard, Weak,
    },
    thread,
    time::{Duration, Instant},
};

/// Where the controller is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionPhase {
    /// Nothing is running.
    Idle,
    /// A start request is opening files and devices.
    Starting,
    /// A session is collecting.
    Active,
    /// A stop request is closing the session.
    Stopping,
}

/// Parameters of a new session.
#[derive(Debug, Clone, PartialEq)]
pub struct StartRequest {
    /// Distance or free-form tag that goes into every artifact name.
    pub label: String,
    /// Stop on its own after this long.
    pub duration: Option<Duration>,
    /// Record video alongside CSI, if a camera is configured.
    pub video: bool,
}

impl StartRequest {
    /// A CSI and video session without a time limit.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            duration: None,
            video: true,
        }
    }
}

/// What a successful start opened.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStarted {
    /// Session number, unique for the controller's lifetime.
    pub id: u64,
    /// The session CSV.
    pub csv_path: PathBuf,
    /// The video container, if the camera came up.
    pub video_path: Option<PathBuf>,
    /// Devices a read loop was started for.
    pub devices: Vec<String>,
}

/// The merged result of a closed session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    /// Session number.
    pub id: u64,
    /// The label it was started with.
    pub label: String,
    /// CSI figures.
    pub csi: CsiSessionResult,
    /// Video figures, if video was recorded.
    pub video: Option<VideoSessionResult>,
    /// False if a read loop was still running when the stop wait ran out.
    pub readers_stopped_within_timeout: bool,
    /// Devices whose read loop gave up during the session.
    pub lost_devices: Vec<String>,
}

/// Session boundaries, as seen by subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A session became active.
    Started(SessionStarted),
    /// A session closed.
    Closed(SessionSummary),
}

/// A live snapshot for status queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    /// Lifecycle phase.
    pub phase: SessionPhase,
    /// Label of the active session.
    pub label: Option<String>,
    /// Rows written so far.
    pub packet_count: u64,
    /// Seconds since the session opened.
    pub elapsed_seconds: f64,
    /// Rows per second.
    pub rate: f64,
    /// RSSI figures.
    pub rssi: RssiTracker,
    /// The session CSV.
    pub csv_path: Option<PathBuf>,
    /// Connected devices.
    pub devices: Vec<String>,
    /// Whether video is being recorded.
    pub recording_video: bool,
    /// Frames recorded so far.
    pub video_frames: u64,
}

struct ActiveSession {
    id: u64,
    label: String,
    readers: Vec<LineReader>,
    video_path: Option<PathBuf>,
}

enum SessionState {
    Idle,
    Starting,
    Active(ActiveSession),
    Stopping,
}

impl SessionState {
    fn phase(&self) -> SessionPhase {
        match self {
            SessionState::Idle => SessionPhase::Idle,
            SessionState::Starting => SessionPhase::Starting,
            SessionState::Active(_) => SessionPhase::Active,
            SessionState::Stopping => SessionPhase::Stopping,
        }
    }
}

/// Runs collection sessions over a set of radios and an optional camera.
pub struct SessionController {
    config: Config,
    commands: Arc<CommandChannel>,
    collector: Arc<CsiCollector>,
    video: Option<Arc<VideoRecorder>>,
    state: Mutex<SessionState>,
    next_id: AtomicU64,
    subscribers: Mutex<Vec<mpsc::Sender<SessionEvent>>>,
}

impl SessionController {
    /// A controller that arms radios through `commands`, hands closed CSV
    /// files to `reporter`, and records from `video` when asked to.
    pub fn new(
        config: Config,
        commands: Arc<CommandChannel>,
        reporter: Option<Arc<dyn SessionReporter>>,
        video: Option<Arc<VideoRecorder>>,
    ) -> Self {
        let collector = Arc::new(CsiCollector::new(
            Some(commands.clone()),
            reporter,
            config.rssi_policy,
        ));
        Self {
            config,
            commands,
            collector,
            video,
            state: Mutex::new(SessionState::Idle),
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// The device registry.
    pub fn devices(&self) -> &Arc<ConnectionManager> {
        self.commands.devices()
    }

    /// The command path to the radios.
    pub fn commands(&self) -> &Arc<CommandChannel> {
        &self.commands
    }

    /// The camera, if one is configured.
    pub fn video(&self) -> Option<&Arc<VideoRecorder>> {
        self.video.as_ref()
    }

    /// Start a session. Fails if one is active or being started or stopped,
    /// if no device is connected after one reconnect attempt, or if the
    /// session file cannot be created. Video is best effort.
    pub fn start(self: &Arc<Self>, request: StartRequest) -> Result<SessionStarted, StartError> {
        validate_label(&request.label)?;
        {
            let mut state = self.lock_state();
            match *state {
                SessionState::Idle => *state = SessionState::Starting,
                SessionState::Active(_) => return Err(StartError::AlreadyActive),
                SessionState::Starting | SessionState::Stopping => return Err(StartError::Busy),
            }
        }

        let (active, started) = match self.open_session(&request) {
            Ok(opened) => opened,
            Err(e) => {
                *self.lock_state() = SessionState::Idle;
                warn!("Session start failed: {}", e);
                return Err(e);
            }
        };
        *self.lock_state() = SessionState::Active(active);
        info!(
            "Session {} started on {} device(s)",
            started.id,
            started.devices.len()
        );

        self.emit(SessionEvent::Started(started.clone()));
        if let Some(duration) = request.duration {
            self.spawn_timer(started.id, duration);
        }
        Ok(started)
    }

    fn open_session(
        &self,
        request: &StartRequest,
    ) -> Result<(ActiveSession, SessionStarted), StartError> {
        let devices = self.devices();
        if !devices.is_connected() {
            info!("No device connected, attempting reconnection");
            if devices.reconnect().is_empty() {
                return Err(StartError::NoDevice);
            }
        }

        self.config
            .create_directories()
            .map_err(StartError::IoError)?;
        let stem = format!(
            "csi_{}m_{}",
            request.label,
            Local::now().format("%Y%m%d_%H%M%S")
        );
        let csv_path = unused_path(&self.config.csi_dir(), &stem, "csv");
        self.collector
            .start(&csv_path)
            .map_err(StartError::CollectorError)?;

        let video_path = match (&self.video, request.video) {
            (Some(video), true) => match video.start(&request.label) {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!("Continuing without video: {}", e);
                    None
                }
            },
            _ => None,
        };

        let sink: Arc<dyn LineSink> = self.collector.clone();
        let readers: Vec<LineReader> = devices
            .connections()
            .into_iter()
            .filter(|c| c.is_alive())
            .filter_map(|c| {
                let port = c.port().to_owned();
                LineReader::spawn(c, sink.clone(), &self.config.reader)
                    .map_err(|e| warn!("Could not start reader for {}: {}", port, e))
                    .ok()
            })
            .collect();

        if readers.is_empty() {
            self.collector.stop();
            if video_path.is_some() {
                if let Some(video) = &self.video {
                    video.stop();
                }
            }
            if let Err(e) = fs::remove_file(&csv_path) {
                debug!("Could not remove {}: {}", csv_path.display(), e);
            }
            return Err(StartError::NoDevice);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let started = SessionStarted {
            id,
            csv_path,
            video_path: video_path.clone(),
            devices: readers.iter().map(|r| r.port().to_owned()).collect(),
        };
        let active = ActiveSession {
            id,
            label: request.label.clone(),
            readers,
            video_path,
        };
        Ok((active, started))
    }

    /// Stop the active session and return its merged summary. Stopping
    /// while nothing is active is a no-op that returns `None`.
    pub fn stop(&self) -> Option<SessionSummary> {
        self.stop_matching(None)
    }

    fn stop_matching(&self, id: Option<u64>) -> Option<SessionSummary> {
        let active = {
            let mut state = self.lock_state();
            match std::mem::replace(&mut *state, SessionState::Stopping) {
                SessionState::Active(active) if id.map_or(true, |id| id == active.id) => active,
                other => {
                    debug!("Stop ignored in phase {:?}", other.phase());
                    *state = other;
                    return None;
                }
            }
        };

        let summary = self.close(active);
        *self.lock_state() = SessionState::Idle;
        info!(
            "Session {} closed: {} packets",
            summary.id, summary.csi.packet_count
        );
        self.emit(SessionEvent::Closed(summary.clone()));
        Some(summary)
    }

    fn close(&self, active: ActiveSession) -> SessionSummary {
        for reader in &active.readers {
            reader.request_stop();
        }
        let timeout = Duration::from_millis(self.config.reader.stop_timeout_ms);
        let deadline = Instant::now() + timeout;
        let mut readers_stopped_within_timeout = true;
        let mut lost_devices = Vec::new();
        for reader in active.readers {
            let port = reader.port().to_owned();
            match reader.stop(deadline.saturating_duration_since(Instant::now())) {
                Some(report) => {
                    debug!("{}: {:?}", port, report);
                    if report.device_lost {
                        lost_devices.push(port);
                    }
                }
                None => readers_stopped_within_timeout = false,
            }
        }

        let csi = self.collector.stop().unwrap_or_else(|| {
            warn!("Collector was already closed");
            CsiSessionResult {
                packet_count: 0,
                elapsed_seconds: 0.0,
                csv_path: PathBuf::new(),
                chart_path: None,
            }
        });

        let video = match (&self.video, &active.video_path) {
            (Some(video), Some(_)) => video.stop(),
            _ => None,
        };

        SessionSummary {
            id: active.id,
            label: active.label,
            csi,
            video,
            readers_stopped_within_timeout,
            lost_devices,
        }
    }

    fn spawn_timer(self: &Arc<Self>, id: u64, duration: Duration) {
        let controller: Weak<Self> = Arc::downgrade(self);
        let spawned = thread::Builder::new()
            .name(format!("session {} timer", id))
            .spawn(move || {
                thread::sleep(duration);
                if let Some(controller) = controller.upgrade() {
                    if controller.stop_matching(Some(id)).is_some() {
                        info!("Session {} reached its {:?} limit", id, duration);
                    }
                }
            });
        if let Err(e) = spawned {
            warn!("Could not start the session timer: {}", e);
        }
    }

    /// Live figures of the current session.
    pub fn status(&self) -> SessionStatus {
        let (phase, label) = {
            let state = self.lock_state();
            let label = match &*state {
                SessionState::Active(active) => Some(active.label.clone()),
                _ => None,
            };
            (state.phase(), label)
        };
        let collector = self.collector.status();
        SessionStatus {
            phase,
            label,
            packet_count: collector.packet_count,
            elapsed_seconds: collector.elapsed_seconds,
            rate: collector.rate,
            rssi: collector.rssi,
            csv_path: collector.csv_path,
            devices: self.devices().connected(),
            recording_video: self.video.as_ref().map_or(false, |v| v.is_recording()),
            video_frames: self.video.as_ref().map_or(0, |v| v.frame_count()),
        }
    }

    /// The last `n` RSSI points of the active session, oldest first. Empty
    /// when idle or before the first packet.
    pub fn recent_rssi(&self, n: usize) -> Vec<RssiPoint> {
        let Some(path) = self.collector.status().csv_path else {
            return Vec::new();
        };
        match RssiSeries::load(&path) {
            Ok(series) => series.tail(n).to_vec(),
            Err(e) => {
                debug!("No RSSI series yet: {}", e);
                Vec::new()
            }
        }
    }

    /// Receive every later [SessionEvent]. Dropping the receiver
    /// unsubscribes.
    pub fn subscribe(&self) -> mpsc::Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel();
        lock(&self.subscribers).push(tx);
        rx
    }

    fn emit(&self, event: SessionEvent) {
        lock(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        lock(&self.state)
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        let active = matches!(*self.lock_state(), SessionState::Active(_));
        if active {
            info!("Closing the active session on shutdown");
            self.stop();
        }
    }
}

/// Check that `label` is usable in a file name: non-empty, and only ASCII
/// letters, digits, `.`, `_` and `-`.
pub fn validate_label(label: &str) -> Result<(), StartError> {
    let ok = !label.is_empty()
        && label != "."
        && label != ".."
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if ok {
        Ok(())
    } else {
        Err(StartError::InvalidLabel(label.to_owned()))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Why a session did not start.
#[derive(Debug)]
pub enum StartError {
    /// The label cannot be used in a file name.
    InvalidLabel(String),
    /// A session is already active.
    AlreadyActive,
    /// A session is being started or stopped.
    Busy,
    /// No radio is connected, even after reconnecting.
    NoDevice,
    /// Returned when the artifact directories cannot be created.
    IoError(std::io::Error),
    /// Returned when the session file cannot be opened.
    CollectorError(CollectorError),
}

impl fmt::Display for StartError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            StartError::InvalidLabel(label) => Cow::from(format!("invalid label '{}'", label)),
            StartError::AlreadyActive => Cow::from("collection already active"),
            StartError::Busy => Cow::from("session is starting or stopping"),
            StartError::NoDevice => Cow::from("no device connected"),
            StartError::IoError(error) => Cow::from(format!("io error: {}", error)),
            StartError::CollectorError(error) => Cow::from(format!("collector error: {}", error)),
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for StartError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AckPolicy;
    use crate::connection_manager::tests::{fast_serial, SharedBackend};
    use crate::device::KeywordClassifier;
    use crate::dummy_radio::{DummyBackend, RadioSettings};
    use crate::summary::RonSummaryReporter;
    use crate::video::recorder::tests::{fast_video, FakeCamera};
    use std::{path::Path, thread::sleep};

    fn config(dir: &Path) -> Config {
        Config {
            data_dir: dir.join("data"),
            serial: fast_serial(),
            ack: AckPolicy::immediate(20),
            video: fast_video(),
            ..Config::default()
        }
    }

    fn controller(
        dir: &Path,
        backend: Arc<DummyBackend>,
        camera: Option<FakeCamera>,
    ) -> Arc<SessionController> {
        let config = config(dir);
        let devices = Arc::new(ConnectionManager::new(
            Box::new(SharedBackend(backend)),
            Box::new(KeywordClassifier::new(config.device_keywords.clone())),
            config.serial.clone(),
        ));
        let commands = Arc::new(CommandChannel::new(
            devices,
            config.commands.clone(),
            config.ack.clone(),
        ));
        let reporter: Arc<dyn SessionReporter> =
            Arc::new(RonSummaryReporter::new(config.chart_dir()));
        let video = camera.map(|camera| {
            Arc::new(VideoRecorder::new(
                config.video.clone(),
                config.video_dir(),
                config.image_dir(),
                Arc::new(camera),
            ))
        });
        Arc::new(SessionController::new(
            config,
            commands,
            Some(reporter),
            video,
        ))
    }

    fn csv_rows(path: &Path) -> usize {
        csv::Reader::from_path(path).unwrap().records().count()
    }

    fn csi_files(dir: &Path) -> usize {
        fs::read_dir(dir.join("data").join("csi"))
            .map(|d| d.count())
            .unwrap_or(0)
    }

    #[test]
    fn full_session_with_video() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(DummyBackend::new(2));
        let ctl = controller(dir.path(), backend.clone(), Some(FakeCamera::endless()));

        let started = ctl.start(StartRequest::new("2")).unwrap();
        assert_eq!(started.devices, vec!["/dev/ttySIM0", "/dev/ttySIM1"]);
        assert!(started.video_path.is_some());
        let name = started.csv_path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("csi_2m_") && name.ends_with(".csv"), "{name}");

        sleep(Duration::from_millis(250));
        let status = ctl.status();
        assert_eq!(status.phase, SessionPhase::Active);
        assert_eq!(status.label.as_deref(), Some("2"));
        assert!(status.packet_count > 0);
        assert!(status.rssi.current.is_some());
        assert!(status.recording_video);

        let summary = ctl.stop().unwrap();
        assert!(summary.readers_stopped_within_timeout);
        assert!(summary.lost_devices.is_empty());
        assert_eq!(summary.csi.csv_path, started.csv_path);
        assert_eq!(summary.csi.packet_count as usize, csv_rows(&started.csv_path));
        assert!(summary.csi.chart_path.unwrap().is_file());
        let video = summary.video.unwrap();
        assert!(video.frame_count > 0);
        assert!(video.stopped_within_timeout);

        for radio in backend.radios() {
            assert_eq!(radio.received_commands(), vec!["", "6", "1", "stop_listen"]);
        }
        assert_eq!(ctl.status().phase, SessionPhase::Idle);
        assert!(ctl.stop().is_none());
    }

    #[test]
    fn no_device_fails_after_one_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(DummyBackend::empty());
        let ctl = controller(dir.path(), backend.clone(), None);

        let err = ctl.start(StartRequest::new("1")).unwrap_err();
        assert!(matches!(err, StartError::NoDevice));
        assert_eq!(err.to_string(), "no device connected");
        assert_eq!(ctl.status().phase, SessionPhase::Idle);
        assert_eq!(csi_files(dir.path()), 0);

        backend.plug();
        assert!(ctl.start(StartRequest::new("1")).is_ok());
        assert!(ctl.stop().is_some());
    }

    #[test]
    fn second_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path(), Arc::new(DummyBackend::new(1)), None);

        let first = ctl.start(StartRequest::new("1")).unwrap();
        let err = ctl.start(StartRequest::new("3")).unwrap_err();
        assert!(matches!(err, StartError::AlreadyActive));
        assert_eq!(err.to_string(), "collection already active");
        assert_eq!(csi_files(dir.path()), 1);

        sleep(Duration::from_millis(50));
        let summary = ctl.stop().unwrap();
        assert_eq!(summary.csi.csv_path, first.csv_path);
        assert_eq!(summary.csi.packet_count as usize, csv_rows(&first.csv_path));
    }

    #[test]
    fn stop_while_idle_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path(), Arc::new(DummyBackend::new(1)), None);
        assert!(ctl.stop().is_none());
        assert!(ctl.stop().is_none());
        assert_eq!(ctl.status().phase, SessionPhase::Idle);
    }

    #[test]
    fn labels_must_be_file_name_safe() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path(), Arc::new(DummyBackend::new(1)), None);
        for label in ["", "..", "../up", "a b", "x/y"] {
            assert!(matches!(
                ctl.start(StartRequest::new(label)),
                Err(StartError::InvalidLabel(_))
            ));
        }
        assert!(validate_label("1.5").is_ok());
        assert!(validate_label("hall_b-2").is_ok());
        assert_eq!(ctl.status().phase, SessionPhase::Idle);
    }

    #[test]
    fn camera_failure_does_not_block_csi() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(
            dir.path(),
            Arc::new(DummyBackend::new(1)),
            Some(FakeCamera::with_frames(0)),
        );
        let started = ctl.start(StartRequest::new("1")).unwrap();
        assert!(started.video_path.is_none());
        sleep(Duration::from_millis(50));
        let summary = ctl.stop().unwrap();
        assert!(summary.video.is_none());
        assert!(summary.csi.packet_count > 0);
    }

    #[test]
    fn csi_only_sessions_leave_the_camera_alone() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(
            dir.path(),
            Arc::new(DummyBackend::new(1)),
            Some(FakeCamera::endless()),
        );
        let request = StartRequest {
            video: false,
            ..StartRequest::new("1")
        };
        assert!(ctl.start(request).unwrap().video_path.is_none());
        assert!(!ctl.video().unwrap().is_recording());
        assert!(ctl.stop().unwrap().video.is_none());
    }

    #[test]
    fn duration_stops_only_its_own_session() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path(), Arc::new(DummyBackend::new(1)), None);
        let events = ctl.subscribe();

        let timed = StartRequest {
            duration: Some(Duration::from_millis(150)),
            ..StartRequest::new("1")
        };
        let first = ctl.start(timed.clone()).unwrap();
        assert!(matches!(events.recv().unwrap(), SessionEvent::Started(s) if s.id == first.id));
        match events.recv_timeout(Duration::from_secs(3)).unwrap() {
            SessionEvent::Closed(summary) => assert_eq!(summary.id, first.id),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(ctl.status().phase, SessionPhase::Idle);

        // A stale timer must not end a later session.
        let second = ctl.start(timed).unwrap();
        ctl.stop().unwrap();
        let third = ctl.start(StartRequest::new("2")).unwrap();
        sleep(Duration::from_millis(300));
        assert_eq!(ctl.status().phase, SessionPhase::Active);
        assert!(second.id < third.id);
        assert_eq!(ctl.stop().unwrap().id, third.id);
    }

    #[test]
    fn recent_rssi_follows_the_active_session() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path(), Arc::new(DummyBackend::new(1)), None);
        assert!(ctl.recent_rssi(10).is_empty());

        ctl.start(StartRequest::new("1")).unwrap();
        sleep(Duration::from_millis(150));
        let points = ctl.recent_rssi(5);
        assert!(!points.is_empty() && points.len() <= 5);
        assert!(points.iter().all(|p| (-95.0..=-20.0).contains(&p.rssi)));

        ctl.stop();
        assert!(ctl.recent_rssi(10).is_empty());
    }

    #[test]
    fn failing_radio_is_reported_lost() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(DummyBackend::with_settings(
            1,
            RadioSettings {
                fail_after: Some(5),
                ..RadioSettings::default()
            },
        ));
        let ctl = controller(dir.path(), backend, None);
        ctl.start(StartRequest::new("1")).unwrap();
        sleep(Duration::from_millis(300));

        let summary = ctl.stop().unwrap();
        assert_eq!(summary.lost_devices, vec!["/dev/ttySIM0"]);
        assert!(summary.csi.packet_count > 0);
        assert!(!ctl.devices().connections()[0].is_alive());
    }

    #[test]
    fn lost_radio_is_reopened_on_next_start() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(DummyBackend::with_settings(
            1,
            RadioSettings {
                fail_after: Some(5),
                ..RadioSettings::default()
            },
        ));
        let ctl = controller(dir.path(), backend.clone(), None);
        ctl.start(StartRequest::new("1")).unwrap();
        sleep(Duration::from_millis(300));
        assert_eq!(ctl.stop().unwrap().lost_devices, vec!["/dev/ttySIM0"]);

        let started = ctl.start(StartRequest::new("1")).unwrap();
        assert_eq!(started.devices, vec!["/dev/ttySIM0"]);
        assert_eq!(backend.radios().len(), 2);
        ctl.stop();
    }
}
