use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;
use std::process::{Child, ChildStdout};
use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, RgbImage};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::FacetError;
use crate::utils::ffmpeg;

#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Frames sampled per second of video.
    pub fps: f32,
    /// Longest side of a sampled frame, in pixels.
    pub max_side: u32,
    pub probe_timeout: Duration,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self { fps: 3.0, max_side: 960, probe_timeout: Duration::from_secs(30) }
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub index: u64,
    pub timestamp: f64,
    pub image: DynamicImage,
}

/// An opened video: its duration, when known, and a lazy frame sequence.
/// Dropping it releases the decoder.
pub struct SampledVideo {
    pub duration_secs: Option<f64>,
    pub frames: Box<dyn Iterator<Item = Frame> + Send>,
    /// Interrupts a frame read that is blocked, from another thread. `None`
    /// when the decoder has nothing to interrupt.
    pub stop: Option<DecoderStop>,
}

/// Handle that makes a running decoder give up: the frame sequence ends at
/// the next read. Calling it more than once is harmless.
#[derive(Clone)]
pub struct DecoderStop(Arc<dyn Fn() + Send + Sync>);

impl DecoderStop {
    pub fn new(stop: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(stop))
    }

    pub fn stop(&self) {
        (self.0)()
    }
}

impl std::fmt::Debug for DecoderStop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DecoderStop")
    }
}

/// Turns a stored video into timestamped frames. Every call to `open`
/// starts from the beginning of the video.
pub trait FrameDecoder: Send + Sync {
    fn open(&self, source: &Path, config: &SamplerConfig) -> Result<SampledVideo, FacetError>;
}

/// Production decoder: ffprobe for the container, an ffmpeg child for frames.
#[derive(Debug, Default, Clone)]
pub struct FfmpegDecoder;

impl FfmpegDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl FrameDecoder for FfmpegDecoder {
    fn open(&self, source: &Path, config: &SamplerConfig) -> Result<SampledVideo, FacetError> {
        if config.fps <= 0.0 {
            return Err(FacetError::Decode(format!("invalid sampling rate {}", config.fps)));
        }
        let probe = ffmpeg::probe_video(source, config.probe_timeout)
            .map_err(|e| FacetError::Decode(format!("{}: {:#}", source.display(), e)))?;
        let (width, height) = scaled_dimensions(probe.width, probe.height, config.max_side);
        let mut child = ffmpeg::spawn_rawvideo(source, config.fps, width, height)
            .map_err(|e| FacetError::Decode(format!("{:#}", e)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FacetError::Decode("ffmpeg stdout unavailable".to_string()))?;
        debug!(
            "sampling {} at {} fps, {}x{} -> {}x{}",
            source.display(),
            config.fps,
            probe.width,
            probe.height,
            width,
            height
        );
        let child = Arc::new(Mutex::new(Some(child)));
        let killer = child.clone();
        // killing the child closes its stdout, so a blocked read sees EOF
        let stop = DecoderStop::new(move || {
            if let Some(child) = killer.lock().as_mut() {
                let _ = child.kill();
            }
        });
        let frames = FfmpegFrames {
            reader: RawFrameReader::new(BufReader::new(stdout), width, height, config.fps),
            child,
        };
        Ok(SampledVideo { duration_secs: probe.duration_secs, frames: Box::new(frames), stop: Some(stop) })
    }
}

/// Fit `width` x `height` inside `max_side`, keeping the aspect ratio and
/// even dimensions.
pub fn scaled_dimensions(width: u32, height: u32, max_side: u32) -> (u32, u32) {
    let longest = width.max(height);
    let (w, h) = if max_side > 0 && longest > max_side {
        let scale = max_side as f64 / longest as f64;
        ((width as f64 * scale).round() as u32, (height as f64 * scale).round() as u32)
    } else {
        (width, height)
    };
    ((w / 2 * 2).max(2), (h / 2 * 2).max(2))
}

/// Cuts a byte stream of packed rgb24 frames into [`Frame`]s. A short read
/// ends the sequence: whatever was decoded before it is kept.
pub struct RawFrameReader<R> {
    reader: R,
    width: u32,
    height: u32,
    fps: f64,
    next_index: u64,
    done: bool,
}

impl<R: Read> RawFrameReader<R> {
    pub fn new(reader: R, width: u32, height: u32, fps: f32) -> Self {
        Self { reader, width, height, fps: fps as f64, next_index: 0, done: false }
    }

    pub fn frames_read(&self) -> u64 {
        self.next_index
    }
}

impl<R: Read> Iterator for RawFrameReader<R> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        if self.done {
            return None;
        }
        let mut buf = vec![0u8; (self.width * self.height * 3) as usize];
        if let Err(e) = self.reader.read_exact(&mut buf) {
            self.done = true;
            if e.kind() != ErrorKind::UnexpectedEof {
                warn!("frame stream ended after {} frames: {}", self.next_index, e);
            }
            return None;
        }
        let image = RgbImage::from_raw(self.width, self.height, buf)?;
        let index = self.next_index;
        self.next_index += 1;
        Some(Frame { index, timestamp: index as f64 / self.fps, image: DynamicImage::ImageRgb8(image) })
    }
}

struct FfmpegFrames {
    reader: RawFrameReader<BufReader<ChildStdout>>,
    child: Arc<Mutex<Option<Child>>>,
}

impl Iterator for FfmpegFrames {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        let frame = self.reader.next();
        if frame.is_none() {
            let status = self.child.lock().as_mut().and_then(|c| c.try_wait().ok().flatten());
            if let Some(status) = status {
                if !status.success() {
                    warn!("ffmpeg exited with {} after {} frames; keeping what was decoded", status, self.reader.frames_read());
                }
            }
        }
        frame
    }
}

impl Drop for FfmpegFrames {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.lock().take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
