pub mod frame;
pub mod gate;
pub mod source;
#[cfg(feature = "v4l2")]
pub mod v4l2;
pub mod worker;

pub use frame::{Frame, FrameMetadata};
pub use gate::{CaptureGate, CaptureMode};
pub use source::{FrameSource, TestPatternSource};
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Source;
pub use worker::{CaptureWorker, StillRequest};

use crate::error::CaptureError;
use crate::CaptureConfig;

/// Open the configured device, or the test pattern when none is set.
pub fn open_source(config: &CaptureConfig) -> Result<Box<dyn FrameSource>, CaptureError> {
    match config.device.as_deref() {
        None => Ok(Box::new(TestPatternSource::new(
            config.resolution,
            config.still_resolution,
            config.clamped_fps(),
            config.jpeg_quality,
        ))),
        #[cfg(feature = "v4l2")]
        Some(path) => Ok(Box::new(V4l2Source::open(path, config)?)),
        #[cfg(not(feature = "v4l2"))]
        Some(path) => Err(CaptureError::Device(format!(
            "{path}: built without the `v4l2` feature"
        ))),
    }
}
