//! The capture loop and its start/stop bookkeeping.

use super::pacer::FramePacer;
use super::source::{CameraConnector, Frame, FrameSource};
use super::VideoError;
use crate::config::{unused_path, VideoConfig};
use chrono::Local;
use log::{info, warn};
use serde::Serialize;
use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread::{self, sleep, JoinHandle},
    time::{Duration, Instant},
};

/// Name of the still written by [VideoRecorder::probe].
pub const PROBE_FILE_NAME: &str = "camera_test_frame.jpg";

/// What a finished recording produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoSessionResult {
    /// The `.mjpeg` container.
    pub video_path: PathBuf,
    /// Frames written, the priming frame included.
    pub frame_count: u64,
    /// Seconds between start and stop.
    pub duration_seconds: f64,
    /// Directory holding one still per frame.
    pub image_dir: PathBuf,
    /// False if the capture loop was still running when the stop wait ran
    /// out. It then finishes on its own and the frame count may still grow
    /// by one.
    pub stopped_within_timeout: bool,
}

struct Recording {
    stop: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
    started: Instant,
    video_path: PathBuf,
    frame_dir: PathBuf,
    handle: JoinHandle<()>,
}

/// Records one camera at a time.
pub struct VideoRecorder {
    config: Mutex<VideoConfig>,
    video_dir: PathBuf,
    image_dir: PathBuf,
    connector: Arc<dyn CameraConnector>,
    recording: Mutex<Option<Recording>>,
}

impl VideoRecorder {
    /// A recorder writing containers to `video_dir` and stills under
    /// `image_dir`.
    pub fn new(
        config: VideoConfig,
        video_dir: impl Into<PathBuf>,
        image_dir: impl Into<PathBuf>,
        connector: Arc<dyn CameraConnector>,
    ) -> Self {
        Self {
            config: Mutex::new(config),
            video_dir: video_dir.into(),
            image_dir: image_dir.into(),
            connector,
            recording: Mutex::new(None),
        }
    }

    /// The stream the next recording connects to.
    pub fn stream_url(&self) -> String {
        lock(&self.config).stream_url.clone()
    }

    /// Point later recordings at another stream. A running recording keeps
    /// its stream.
    pub fn set_stream_url(&self, url: impl Into<String>) {
        let url = url.into();
        info!("Camera stream set to {}", url);
        lock(&self.config).stream_url = url;
    }

    /// Connect, wait for a first frame, create the output files, and start
    /// the capture loop. Nothing is created if the camera gives no frame.
    pub fn start(&self, label: &str) -> Result<PathBuf, VideoError> {
        let mut recording = lock(&self.recording);
        if recording.is_some() {
            return Err(VideoError::AlreadyRecording);
        }
        let config = lock(&self.config).clone();

        let mut source = self.connector.connect(&config.stream_url)?;
        let first = source.read_frame()?.ok_or(VideoError::NoFrame)?;
        let (width, height) = first.dimensions()?;

        fs::create_dir_all(&self.video_dir).map_err(VideoError::IoError)?;
        let stem = format!("video_{}m_{}", label, Local::now().format("%Y%m%d_%H%M%S"));
        let video_path = unused_path(&self.video_dir, &stem, "mjpeg");
        let frame_dir = match video_path.file_stem() {
            Some(stem) => self.image_dir.join(stem),
            None => self.image_dir.join(&stem),
        };
        fs::create_dir_all(&frame_dir).map_err(VideoError::IoError)?;
        let out = BufWriter::new(File::create(&video_path).map_err(VideoError::IoError)?);

        let stop = Arc::new(AtomicBool::new(false));
        let frames = Arc::new(AtomicU64::new(0));
        let th_stop = stop.clone();
        let th_frames = frames.clone();
        let th_frame_dir = frame_dir.clone();
        let fps = config.fps;
        let handle = thread::Builder::new()
            .name("video capture".to_owned())
            .spawn(move || {
                capture_loop(
                    source,
                    first,
                    out,
                    &th_frame_dir,
                    fps,
                    &th_stop,
                    &th_frames,
                )
            })
            .map_err(VideoError::IoError)?;

        info!(
            "Recording {}x{} at {} fps into {}",
            width,
            height,
            fps,
            video_path.display()
        );
        *recording = Some(Recording {
            stop,
            frames,
            started: Instant::now(),
            video_path: video_path.clone(),
            frame_dir,
            handle,
        });
        Ok(video_path)
    }

    /// Stop the capture loop, waiting up to the configured stop timeout.
    /// Returns `None` if nothing was recording.
    pub fn stop(&self) -> Option<VideoSessionResult> {
        let recording = lock(&self.recording).take()?;
        let timeout = Duration::from_millis(lock(&self.config).stop_timeout_ms);
        recording.stop.store(true, Ordering::SeqCst);

        let deadline = Instant::now() + timeout;
        while !recording.handle.is_finished() && Instant::now() < deadline {
            sleep(Duration::from_millis(5));
        }
        let stopped_within_timeout = recording.handle.is_finished();
        if stopped_within_timeout {
            if recording.handle.join().is_err() {
                warn!("Video capture loop panicked");
            }
        } else {
            warn!("Video capture loop did not stop within {:?}", timeout);
        }

        let result = VideoSessionResult {
            video_path: recording.video_path,
            frame_count: recording.frames.load(Ordering::SeqCst),
            duration_seconds: recording.started.elapsed().as_secs_f64(),
            image_dir: recording.frame_dir,
            stopped_within_timeout,
        };
        info!(
            "Video stopped: {} frames in {:.1}s",
            result.frame_count, result.duration_seconds
        );
        Some(result)
    }

    /// Whether a recording is running.
    pub fn is_recording(&self) -> bool {
        lock(&self.recording).is_some()
    }

    /// Frames written by the running recording, 0 when idle.
    pub fn frame_count(&self) -> u64 {
        lock(&self.recording)
            .as_ref()
            .map_or(0, |r| r.frames.load(Ordering::SeqCst))
    }

    /// Grab one frame and save it as [PROBE_FILE_NAME] in the image
    /// directory. Works while a recording runs, on a separate connection.
    pub fn probe(&self) -> Result<(PathBuf, (u32, u32)), VideoError> {
        let url = self.stream_url();
        let mut source = self.connector.connect(&url)?;
        let frame = source.read_frame()?.ok_or(VideoError::NoFrame)?;
        let dimensions = frame.dimensions()?;

        fs::create_dir_all(&self.image_dir).map_err(VideoError::IoError)?;
        let path = self.image_dir.join(PROBE_FILE_NAME);
        fs::write(&path, frame.jpeg()).map_err(VideoError::IoError)?;
        info!(
            "Camera at {} answered with {}x{}",
            url, dimensions.0, dimensions.1
        );
        Ok((path, dimensions))
    }
}

fn capture_loop(
    mut source: Box<dyn FrameSource>,
    first: Frame,
    mut out: BufWriter<File>,
    frame_dir: &Path,
    fps: f64,
    stop: &AtomicBool,
    frames: &AtomicU64,
) {
    let mut pacer = FramePacer::new(fps, Instant::now());
    let mut next = Some(first);

    while !stop.load(Ordering::SeqCst) {
        let frame = match next.take() {
            Some(frame) => frame,
            None => match source.read_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    info!("Camera stream ended");
                    break;
                }
                Err(e) => {
                    warn!("Camera read failed: {}", e);
                    break;
                }
            },
        };
        if let Err(e) = write_frame(&mut out, frame_dir, &frame) {
            warn!("Failed to write frame: {}", e);
            break;
        }
        frames.fetch_add(1, Ordering::SeqCst);
        pacer.wait();
    }

    if let Err(e) = out.flush() {
        warn!("Failed to flush video: {}", e);
    }
}

fn write_frame(out: &mut BufWriter<File>, frame_dir: &Path, frame: &Frame) -> std::io::Result<()> {
    out.write_all(frame.jpeg())?;
    out.flush()?;
    let name = format!("frame_{}.jpg", Local::now().format("%Y%m%d_%H%M%S_%6f"));
    fs::write(frame_dir.join(name), frame.jpeg())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::video::source::tests::jpeg;

    /// Serves `frames` copies of a small JPEG, then ends. With `stall`, every
    /// read after the first blocks for that long.
    pub(crate) struct FakeCamera {
        pub frames: usize,
        pub stall: Option<Duration>,
        pub refuse: bool,
        pub urls: Mutex<Vec<String>>,
    }

    impl FakeCamera {
        pub(crate) fn endless() -> Self {
            Self::with_frames(usize::MAX)
        }

        pub(crate) fn with_frames(frames: usize) -> Self {
            Self {
                frames,
                stall: None,
                refuse: false,
                urls: Mutex::new(Vec::new()),
            }
        }
    }

    struct FakeSource {
        remaining: usize,
        stall: Option<Duration>,
        served: usize,
        jpeg: Vec<u8>,
    }

    impl FrameSource for FakeSource {
        fn read_frame(&mut self) -> Result<Option<Frame>, VideoError> {
            if self.remaining == 0 {
                return Ok(None);
            }
            if let (Some(stall), true) = (self.stall, self.served > 0) {
                sleep(stall);
            }
            self.remaining -= 1;
            self.served += 1;
            Ok(Some(Frame::new(self.jpeg.clone())))
        }
    }

    impl CameraConnector for FakeCamera {
        fn connect(&self, url: &str) -> Result<Box<dyn FrameSource>, VideoError> {
            self.urls.lock().unwrap().push(url.to_owned());
            if self.refuse {
                return Err(VideoError::IoError(std::io::ErrorKind::ConnectionRefused.into()));
            }
            Ok(Box::new(FakeSource {
                remaining: self.frames,
                stall: self.stall,
                served: 0,
                jpeg: jpeg(8, 8, 90),
            }))
        }
    }

    pub(crate) fn fast_video() -> VideoConfig {
        VideoConfig {
            enabled: true,
            stream_url: "http://camera.test/video".to_owned(),
            fps: 200.0,
            stop_timeout_ms: 1000,
            connect_timeout_ms: 100,
        }
    }

    fn recorder(dir: &Path, camera: FakeCamera, config: VideoConfig) -> VideoRecorder {
        VideoRecorder::new(
            config,
            dir.join("video"),
            dir.join("images"),
            Arc::new(camera),
        )
    }

    #[test]
    fn records_container_and_stills() {
        let dir = tempfile::tempdir().unwrap();
        let rec = recorder(dir.path(), FakeCamera::endless(), fast_video());

        let path = rec.start("2").unwrap();
        assert!(rec.is_recording());
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("video_2m_") && name.ends_with(".mjpeg"), "{name}");

        sleep(Duration::from_millis(100));
        let result = rec.stop().unwrap();
        assert!(result.stopped_within_timeout);
        assert!(result.frame_count > 1);
        assert!(!rec.is_recording());

        let frame_len = jpeg(8, 8, 90).len() as u64;
        let video_len = fs::metadata(&result.video_path).unwrap().len();
        assert_eq!(video_len, result.frame_count * frame_len);

        let stills = fs::read_dir(&result.image_dir).unwrap().count() as u64;
        // Stills are named to the microsecond; allow for a collision.
        assert!(stills >= result.frame_count - 1 && stills <= result.frame_count);
        assert_eq!(
            result.image_dir.file_name(),
            Path::new(&name).file_stem()
        );

        assert!(rec.stop().is_none());
    }

    #[test]
    fn no_frame_fails_without_output() {
        let dir = tempfile::tempdir().unwrap();
        let rec = recorder(dir.path(), FakeCamera::with_frames(0), fast_video());
        assert!(matches!(rec.start("1"), Err(VideoError::NoFrame)));
        assert!(!rec.is_recording());
        assert!(!dir.path().join("video").exists());
    }

    #[test]
    fn refused_connection_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let camera = FakeCamera {
            refuse: true,
            ..FakeCamera::endless()
        };
        let rec = recorder(dir.path(), camera, fast_video());
        assert!(matches!(rec.start("1"), Err(VideoError::IoError(_))));
        assert!(rec.stop().is_none());
    }

    #[test]
    fn second_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let rec = recorder(dir.path(), FakeCamera::endless(), fast_video());
        rec.start("1").unwrap();
        assert!(matches!(rec.start("1"), Err(VideoError::AlreadyRecording)));
        assert!(rec.stop().is_some());
    }

    #[test]
    fn loop_ends_with_the_stream() {
        let dir = tempfile::tempdir().unwrap();
        let rec = recorder(dir.path(), FakeCamera::with_frames(3), fast_video());
        rec.start("1").unwrap();
        sleep(Duration::from_millis(100));
        let result = rec.stop().unwrap();
        assert_eq!(result.frame_count, 3);
        assert!(result.stopped_within_timeout);
    }

    #[test]
    fn stuck_camera_bounds_the_stop() {
        let dir = tempfile::tempdir().unwrap();
        let camera = FakeCamera {
            stall: Some(Duration::from_millis(800)),
            ..FakeCamera::endless()
        };
        let config = VideoConfig {
            stop_timeout_ms: 50,
            ..fast_video()
        };
        let rec = recorder(dir.path(), camera, config);
        rec.start("1").unwrap();
        sleep(Duration::from_millis(20));

        let begin = Instant::now();
        let result = rec.stop().unwrap();
        assert!(begin.elapsed() < Duration::from_millis(500));
        assert!(!result.stopped_within_timeout);
        assert_eq!(result.frame_count, 1);
    }

    #[test]
    fn probe_saves_a_test_frame() {
        let dir = tempfile::tempdir().unwrap();
        let camera = Arc::new(FakeCamera::endless());
        let rec = VideoRecorder::new(
            fast_video(),
            dir.path().join("video"),
            dir.path().join("images"),
            camera.clone(),
        );
        rec.set_stream_url("http://10.0.0.2:8080/video");

        let (path, dims) = rec.probe().unwrap();
        assert_eq!(dims, (8, 8));
        assert_eq!(path, dir.path().join("images").join(PROBE_FILE_NAME));
        assert!(path.is_file());
        assert_eq!(
            *camera.urls.lock().unwrap(),
            vec!["http://10.0.0.2:8080/video".to_owned()]
        );
    }
}
