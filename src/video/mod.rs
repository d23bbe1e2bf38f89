//! Video capture alongside a CSI session.
//!
//! The recorder pulls JPEG frames from a network camera, appends each one to
//! a concatenated-JPEG `.mjpeg` container and also saves it as a still
//! image, pacing itself to a fixed frame rate.

pub mod pacer;
pub mod recorder;
pub mod source;

pub use recorder::{VideoRecorder, VideoSessionResult};
pub use source::{CameraConnector, Frame, FrameSource, HttpCamera, MjpegStream};

use std::{borrow::Cow, fmt};

/// Everything that can go wrong while recording video.
#[derive(Debug)]
pub enum VideoError {
    /// A recording is already running.
    AlreadyRecording,
    /// The camera produced no frame.
    NoFrame,
    /// Returned when the camera stream cannot be opened.
    HttpError(reqwest::Error),
    /// Returned when a frame is not a decodable JPEG.
    ImageError(image::ImageError),
    /// Returned when io fails while reading the stream or writing output.
    IoError(std::io::Error),
}

impl fmt::Display for VideoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            VideoError::AlreadyRecording => Cow::from("video recording already active"),
            VideoError::NoFrame => Cow::from("camera produced no frame"),
            VideoError::HttpError(error) => Cow::from(format!("http error: {}", error)),
            VideoError::ImageError(error) => Cow::from(format!("image error: {}", error)),
            VideoError::IoError(error) => Cow::from(format!("io error: {}", error)),
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for VideoError {}
