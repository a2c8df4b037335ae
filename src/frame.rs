use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Identifier of a hardware frame buffer. Unique among in-flight frames of a
/// single camera; recycled by the device once the buffer is released.
pub type BufferId = u32;

/// Frame data with zero-copy semantics
#[derive(Clone)]
pub struct Frame {
    /// Hardware buffer backing this frame
    pub buffer_id: BufferId,

    /// Id of the physical camera that produced the frame
    pub source_id: String,

    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("buffer_id", &self.buffer_id)
            .field("source_id", &self.source_id)
            .field("len", &self.data.len())
            .field("sequence", &self.meta.sequence)
            .finish()
    }
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Yuyv4,
    Mjpeg,
    Nv12,
}
