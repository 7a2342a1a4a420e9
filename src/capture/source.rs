//! Frame sources driven by the capture worker

use std::thread;
use std::time::{Duration, Instant};

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use crate::capture::Frame;
use crate::error::CaptureError;
use crate::Resolution;

/// Blocking producer of JPEG frames. Owned by a single worker thread.
pub trait FrameSource: Send {
    fn name(&self) -> &str;

    /// Next low-resolution stream frame; may block until the device delivers one.
    fn stream_frame(&mut self) -> Result<Frame, CaptureError>;

    /// One full-resolution still. Sources that need a mode switch must restore
    /// streaming before returning, on success and on failure.
    fn capture_still(&mut self) -> Result<Frame, CaptureError>;
}

/// Synthetic moving gradient, for running without a camera
pub struct TestPatternSource {
    stream: Resolution,
    still: Resolution,
    interval: Duration,
    quality: u8,
    tick: u32,
    next_due: Option<Instant>,
}

impl TestPatternSource {
    pub fn new(stream: Resolution, still: Option<Resolution>, fps: u32, quality: u8) -> Self {
        let still = still.unwrap_or(Resolution::new(stream.width * 2, stream.height * 2));
        Self {
            stream,
            still,
            interval: Duration::from_micros(1_000_000 / u64::from(fps.max(1))),
            quality: quality.clamp(1, 100),
            tick: 0,
            next_due: None,
        }
    }

    fn render(&self, size: Resolution) -> Result<Vec<u8>, CaptureError> {
        let (w, h) = (size.width, size.height);
        let shift = self.tick.wrapping_mul(4);
        let mut rgb = Vec::with_capacity((w * h * 3) as usize);
        for y in 0..h {
            for x in 0..w {
                rgb.push((x * 255 / w.max(1)).wrapping_add(shift) as u8);
                rgb.push((y * 255 / h.max(1)).wrapping_add(shift / 2) as u8);
                rgb.push((self.tick % 256) as u8);
            }
        }

        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, self.quality)
            .encode(&rgb, w, h, ExtendedColorType::Rgb8)
            .map_err(|e| CaptureError::Encode(e.to_string()))?;
        Ok(jpeg)
    }
}

impl FrameSource for TestPatternSource {
    fn name(&self) -> &str {
        "test-pattern"
    }

    fn stream_frame(&mut self) -> Result<Frame, CaptureError> {
        // Pace output like a real sensor running at the configured rate
        let now = Instant::now();
        if let Some(due) = self.next_due {
            if due > now {
                thread::sleep(due - now);
            }
        }
        self.next_due = Some(Instant::now() + self.interval);

        self.tick = self.tick.wrapping_add(1);
        let data = self.render(self.stream)?;
        Ok(Frame::jpeg(data, self.stream.width, self.stream.height))
    }

    fn capture_still(&mut self) -> Result<Frame, CaptureError> {
        let data = self.render(self.still)?;
        Ok(Frame::still(data, self.still.width, self.still.height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_jpeg(data: &[u8]) -> bool {
        data.starts_with(&[0xFF, 0xD8]) && data.ends_with(&[0xFF, 0xD9])
    }

    #[test]
    fn test_pattern_produces_jpeg_frames() {
        let mut source = TestPatternSource::new(Resolution::new(32, 24), None, 60, 80);

        let frame = source.stream_frame().unwrap();
        assert!(is_jpeg(&frame.data));
        assert_eq!((frame.meta.width, frame.meta.height), (32, 24));
        assert!(!frame.meta.still);

        let still = source.capture_still().unwrap();
        assert!(is_jpeg(&still.data));
        assert_eq!((still.meta.width, still.meta.height), (64, 48));
        assert!(still.meta.still);
    }

    #[test]
    fn test_pattern_is_paced() {
        let mut source = TestPatternSource::new(Resolution::new(8, 8), None, 20, 50);
        let start = Instant::now();
        for _ in 0..3 {
            source.stream_frame().unwrap();
        }
        // first frame is immediate, the next two wait one interval each
        assert!(start.elapsed() >= Duration::from_millis(90));
    }
}
