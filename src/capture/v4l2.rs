//! V4L2 MJPEG capture with memory-mapped buffers

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::framesize::FrameSizeEnum;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::{Frame, FrameSource};
use crate::error::CaptureError;
use crate::{CaptureConfig, Resolution};

/// Frames thrown away after a mode switch while exposure settles
const STILL_WARMUP_FRAMES: usize = 2;

const MJPG: &[u8; 4] = b"MJPG";

/// Camera that hands out the device's own MJPEG output, no re-encoding
pub struct V4l2Source {
    name: String,
    device: Box<Device>,
    stream: Option<MmapStream<'static>>,
    stream_size: Resolution,
    still_size: Resolution,
    buffer_count: u32,
}

impl V4l2Source {
    pub fn open(path: &str, config: &CaptureConfig) -> Result<Self, CaptureError> {
        info!("Initializing V4L2 capture: {}", path);

        let device = Device::with_path(path)?;

        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CaptureError::Device(format!(
                "{path} doesn't support video capture"
            )));
        }

        let still_size = match config.still_resolution {
            Some(size) => size,
            None => largest_mjpeg_size(&device)?.unwrap_or(config.resolution),
        };

        let fps = config.clamped_fps();
        if let Err(e) = device.set_params(&Parameters::with_fps(fps)) {
            warn!("Could not set {} fps: {}", fps, e);
        }

        let mut source = Self {
            name: format!("{} ({})", caps.card, path),
            device: Box::new(device),
            stream: None,
            stream_size: config.resolution,
            still_size,
            buffer_count: config.buffer_count.max(1),
        };
        source.stream_size = source.start_stream(config.resolution)?;
        info!(
            "Streaming {} MJPEG, stills at {}",
            source.stream_size, source.still_size
        );
        Ok(source)
    }

    fn set_format(&self, size: Resolution) -> Result<Resolution, CaptureError> {
        let mut fmt = self.device.format()?;
        fmt.width = size.width;
        fmt.height = size.height;
        fmt.fourcc = FourCC::new(MJPG);

        let applied = self.device.set_format(&fmt)?;
        if applied.fourcc != FourCC::new(MJPG) {
            return Err(CaptureError::Device(format!(
                "device refused MJPEG, offered {}",
                applied.fourcc
            )));
        }
        if (applied.width, applied.height) != (size.width, size.height) {
            warn!(
                "requested {}, device chose {}x{}",
                size, applied.width, applied.height
            );
        }
        Ok(Resolution::new(applied.width, applied.height))
    }

    fn start_stream(&mut self, size: Resolution) -> Result<Resolution, CaptureError> {
        // Buffers must be released before the format can change
        self.stream = None;
        let applied = self.set_format(size)?;
        let stream = MmapStream::with_buffers(&self.device, Type::VideoCapture, self.buffer_count)?;
        self.stream = Some(stream);
        debug!("Capture stream started at {}", applied);
        Ok(applied)
    }

    fn grab(&mut self, size: Resolution, still: bool) -> Result<Frame, CaptureError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| CaptureError::Device("stream not started".into()))?;

        let (buf, meta) = stream.next()?;
        let used = (meta.bytesused as usize).min(buf.len());
        let data = Bytes::copy_from_slice(&buf[..used]);

        Ok(if still {
            Frame::still(data, size.width, size.height)
        } else {
            Frame::jpeg(data, size.width, size.height)
        })
    }

    fn still_in_mode(&mut self) -> Result<Frame, CaptureError> {
        let size = self.start_stream(self.still_size)?;
        for _ in 0..STILL_WARMUP_FRAMES {
            self.grab(size, true)?;
        }
        self.grab(size, true)
    }
}

impl FrameSource for V4l2Source {
    fn name(&self) -> &str {
        &self.name
    }

    fn stream_frame(&mut self) -> Result<Frame, CaptureError> {
        self.grab(self.stream_size, false)
    }

    #[instrument(skip(self), fields(size = %self.still_size))]
    fn capture_still(&mut self) -> Result<Frame, CaptureError> {
        let still = self.still_in_mode();

        // Streaming is restored whatever happened to the still
        let restored = self.start_stream(self.stream_size);
        match (still, restored) {
            (Ok(frame), Ok(_)) => Ok(frame),
            (Err(e), _) => Err(e),
            (Ok(_), Err(e)) => Err(e),
        }
    }
}

fn largest_mjpeg_size(device: &Device) -> Result<Option<Resolution>, CaptureError> {
    let sizes = device.enum_framesizes(FourCC::new(MJPG))?;
    let largest = sizes
        .into_iter()
        .map(|fs| match fs.size {
            FrameSizeEnum::Discrete(d) => Resolution::new(d.width, d.height),
            FrameSizeEnum::Stepwise(s) => Resolution::new(s.max_width, s.max_height),
        })
        .max_by_key(|r| u64::from(r.width) * u64::from(r.height));
    Ok(largest)
}
