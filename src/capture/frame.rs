use bytes::Bytes;
use std::sync::Arc;

/// One encoded JPEG image, shared read-only by every consumer that observes it
#[derive(Clone)]
pub struct Frame {
    /// Immutable JPEG data - cloning only bumps a reference count
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,
}

#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub width: u32,
    pub height: u32,
    /// Full-resolution still rather than a stream frame
    pub still: bool,
}

impl Frame {
    pub fn jpeg(data: impl Into<Bytes>, width: u32, height: u32) -> Self {
        Self {
            data: data.into(),
            meta: Arc::new(FrameMetadata {
                width,
                height,
                still: false,
            }),
        }
    }

    pub fn still(data: impl Into<Bytes>, width: u32, height: u32) -> Self {
        let mut frame = Self::jpeg(data, width, height);
        frame.meta = Arc::new(FrameMetadata {
            still: true,
            ..(*frame.meta).clone()
        });
        frame
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("bytes", &self.data.len())
            .field("meta", &self.meta)
            .finish()
    }
}
