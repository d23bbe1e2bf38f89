//! Frames from a network camera.
//!
//! Phone camera apps and most IP cameras serve `multipart/x-mixed-replace`
//! MJPEG. Rather than parse the multipart framing, [MjpegStream] scans for
//! JPEG start and end markers, which also copes with servers that skip the
//! part headers altogether.

use super::VideoError;
use image::ImageFormat;
use log::{debug, info};
use std::{io::Read, time::Duration};

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];
/// A frame larger than this means the stream lost sync.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// One JPEG-encoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    jpeg: Vec<u8>,
}

impl Frame {
    /// Wrap JPEG bytes.
    pub fn new(jpeg: Vec<u8>) -> Self {
        Self { jpeg }
    }

    /// The encoded bytes.
    pub fn jpeg(&self) -> &[u8] {
        &self.jpeg
    }

    /// Width and height, by decoding the image.
    pub fn dimensions(&self) -> Result<(u32, u32), VideoError> {
        let img = image::load_from_memory_with_format(&self.jpeg, ImageFormat::Jpeg)
            .map_err(VideoError::ImageError)?;
        Ok((img.width(), img.height()))
    }
}

/// Anything that yields frames one at a time.
pub trait FrameSource: Send {
    /// The next frame, or `None` once the source is exhausted.
    fn read_frame(&mut self) -> Result<Option<Frame>, VideoError>;
}

/// Opens [FrameSource]s by URL.
pub trait CameraConnector: Send + Sync {
    /// Connect to `url`.
    fn connect(&self, url: &str) -> Result<Box<dyn FrameSource>, VideoError>;
}

/// Splits a byte stream into JPEG frames.
pub struct MjpegStream<R> {
    reader: R,
    buf: Vec<u8>,
    chunk: Vec<u8>,
}

impl<R: Read> MjpegStream<R> {
    /// Wrap a reader positioned anywhere in an MJPEG stream.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            chunk: vec![0; 64 * 1024],
        }
    }

    fn take_frame(&mut self) -> Option<Frame> {
        let start = find(&self.buf, &SOI, 0)?;
        let end = find(&self.buf, &EOI, start + SOI.len())?;
        let frame = self.buf[start..end + EOI.len()].to_vec();
        self.buf.drain(..end + EOI.len());
        Some(Frame::new(frame))
    }
}

impl<R: Read + Send> FrameSource for MjpegStream<R> {
    fn read_frame(&mut self) -> Result<Option<Frame>, VideoError> {
        loop {
            if let Some(frame) = self.take_frame() {
                return Ok(Some(frame));
            }
            if self.buf.len() > MAX_FRAME_LEN {
                debug!("Dropping {} bytes of unsynchronised stream", self.buf.len());
                let keep_from = self.buf.len() - 1;
                self.buf.drain(..keep_from);
            }
            let n = self.reader.read(&mut self.chunk).map_err(VideoError::IoError)?;
            if n == 0 {
                return Ok(None);
            }
            self.buf.extend_from_slice(&self.chunk[..n]);
        }
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Connects to MJPEG-over-HTTP cameras.
#[derive(Debug, Clone)]
pub struct HttpCamera {
    connect_timeout: Duration,
}

impl HttpCamera {
    /// A connector that gives up connecting after `connect_timeout`. Once
    /// connected, reads never time out; a stream is open-ended.
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl CameraConnector for HttpCamera {
    fn connect(&self, url: &str) -> Result<Box<dyn FrameSource>, VideoError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(self.connect_timeout)
            .timeout(None::<Duration>)
            .build()
            .map_err(VideoError::HttpError)?;
        let response = client
            .get(url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(VideoError::HttpError)?;
        info!("Connected to camera {}", url);
        Ok(Box::new(MjpegStream::new(response)))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::io::Cursor;

    pub(crate) fn jpeg(width: u32, height: u32, shade: u8) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([shade, 0, 255 - shade]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Jpeg).unwrap();
        out.into_inner()
    }

    fn multipart(frames: &[Vec<u8>]) -> Vec<u8> {
        let mut body = Vec::new();
        for f in frames {
            body.extend_from_slice(b"--myboundary\r\nContent-Type: image/jpeg\r\n");
            body.extend_from_slice(format!("Content-Length: {}\r\n\r\n", f.len()).as_bytes());
            body.extend_from_slice(f);
            body.extend_from_slice(b"\r\n");
        }
        body
    }

    /// A reader that hands out at most `step` bytes per call.
    struct Trickle(Cursor<Vec<u8>>, usize);

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = buf.len().min(self.1);
            self.0.read(&mut buf[..n])
        }
    }

    #[test]
    fn splits_multipart_stream() {
        let frames = vec![jpeg(8, 6, 10), jpeg(8, 6, 200)];
        let mut stream = MjpegStream::new(Cursor::new(multipart(&frames)));

        assert_eq!(stream.read_frame().unwrap().unwrap().jpeg(), &frames[0][..]);
        assert_eq!(stream.read_frame().unwrap().unwrap().jpeg(), &frames[1][..]);
        assert!(stream.read_frame().unwrap().is_none());
    }

    #[test]
    fn frames_survive_tiny_reads() {
        let frames = vec![jpeg(4, 4, 1), jpeg(4, 4, 2), jpeg(4, 4, 3)];
        let mut stream = MjpegStream::new(Trickle(Cursor::new(multipart(&frames)), 7));
        for f in &frames {
            assert_eq!(stream.read_frame().unwrap().unwrap().jpeg(), &f[..]);
        }
    }

    #[test]
    fn truncated_frame_is_not_returned() {
        let mut bytes = jpeg(4, 4, 1);
        bytes.truncate(bytes.len() - 2);
        let mut stream = MjpegStream::new(Cursor::new(bytes));
        assert!(stream.read_frame().unwrap().is_none());
    }

    #[test]
    fn dimensions_come_from_the_jpeg() {
        assert_eq!(Frame::new(jpeg(16, 9, 0)).dimensions().unwrap(), (16, 9));
        assert!(Frame::new(vec![0xFF, 0xD8, 0xFF, 0xD9]).dimensions().is_err());
    }
}
