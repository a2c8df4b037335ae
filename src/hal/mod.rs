//! Contracts of the underlying camera hardware layer.
//!
//! The multiplexing core never talks to a device directly; everything goes
//! through the trait objects defined here. Backends live in submodules:
//! [`mock`] for tests and demos, [`v4l2`] for real V4L2 devices.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::EvsResult;
use crate::frame::{BufferId, Frame, PixelFormat};

pub mod mock;
#[cfg(feature = "v4l2-hal")]
pub mod v4l2;

/// Identity and capability metadata of a physical camera. Read-only after
/// discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraDescriptor {
    pub id: String,
    pub vendor_flags: u32,
    /// Vendor-opaque metadata blob.
    pub metadata: Vec<u8>,
    /// Non-empty marks a logical multi-camera aggregate; entries are the
    /// constituent physical camera ids.
    pub physical_ids: Vec<String>,
}

impl CameraDescriptor {
    pub fn physical(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            vendor_flags: 0,
            metadata: Vec::new(),
            physical_ids: Vec::new(),
        }
    }

    pub fn logical(id: impl Into<String>, physical_ids: Vec<String>) -> Self {
        Self {
            id: id.into(),
            vendor_flags: 0,
            metadata: Vec::new(),
            physical_ids,
        }
    }

    pub fn is_logical(&self) -> bool {
        !self.physical_ids.is_empty()
    }
}

/// Stream configuration requested when opening a camera.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub id: i32,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub fps: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            id: 0,
            width: 800,
            height: 600,
            format: PixelFormat::Mjpeg,
            fps: 30,
        }
    }
}

/// Camera parameters a primary client may adjust.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CameraParam {
    Brightness,
    Contrast,
    AutoGain,
    Gain,
    AutoWhiteBalance,
    WhiteBalanceTemperature,
    Sharpness,
    AutoExposure,
    AbsoluteExposure,
    AutoFocus,
    AbsoluteFocus,
    AbsoluteZoom,
}

/// Stream lifecycle and notification events pushed to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvsEventKind {
    StreamStarted,
    StreamStopped,
    FrameDropped,
    TimeoutExpired,
    ParameterChanged,
    PrimaryClientReleased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvsEvent {
    pub kind: EvsEventKind,
    pub payload: [i32; 2],
}

impl EvsEvent {
    pub fn new(kind: EvsEventKind) -> Self {
        Self {
            kind,
            payload: [0; 2],
        }
    }

    pub fn stream_stopped() -> Self {
        Self::new(EvsEventKind::StreamStopped)
    }

    pub fn parameter_changed(id: CameraParam, value: i32) -> Self {
        Self {
            kind: EvsEventKind::ParameterChanged,
            payload: [id as i32, value],
        }
    }
}

/// State of the (single) video display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayState {
    NotOpen,
    NotVisible,
    VisibleOnNextFrame,
    Visible,
    Dead,
}

/// An externally allocated buffer offered to a camera via
/// `import_external_buffers`.
#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub buffer_id: BufferId,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    pub data: Bytes,
}

/// Receiver of frames and events from a camera.
///
/// Implementations must hand the frame off (queue it, send it over a channel)
/// and return promptly: delivery happens on the producer's callback thread,
/// and a slow sink stalls every other consumer of the same device. A sink
/// must not call back into the camera API synchronously from these methods.
pub trait CameraSink: Send + Sync {
    fn deliver_frame(&self, frame: Frame);
    fn notify(&self, event: EvsEvent);
}

/// One physical camera device as exposed by the hardware layer.
///
/// `start_video_stream` must not invoke the sink synchronously from within
/// the call; frames and events arrive on the device's own delivery thread.
/// `stop_video_stream` may deliver the terminal `StreamStopped` event
/// synchronously before returning.
pub trait HwCamera: Send + Sync {
    fn descriptor(&self) -> CameraDescriptor;

    fn start_video_stream(&self, sink: Arc<dyn CameraSink>) -> EvsResult<()>;
    fn stop_video_stream(&self);

    /// Returns a buffer to the device for refilling.
    fn done_with_frame(&self, buffer_id: BufferId);

    /// Sets the total number of buffers the device may keep in flight.
    fn set_max_frames_in_flight(&self, count: u32) -> EvsResult<()>;

    /// Writes a parameter and returns the value the device settled on (which
    /// may differ from the requested one after driver-side clamping).
    fn set_parameter(&self, id: CameraParam, value: i32) -> EvsResult<i32>;
    fn get_parameter(&self, id: CameraParam) -> EvsResult<i32>;
    fn parameter_list(&self) -> Vec<CameraParam>;

    fn set_extended_info(&self, opaque_id: u32, value: Vec<u8>) -> EvsResult<()>;
    fn get_extended_info(&self, opaque_id: u32) -> EvsResult<Vec<u8>>;

    /// Offers externally allocated buffers; returns how many were accepted.
    fn import_external_buffers(&self, buffers: Vec<BufferDesc>) -> EvsResult<u32>;
}

/// One display device.
pub trait HwDisplay: Send + Sync {
    fn id(&self) -> u8;
    fn state(&self) -> DisplayState;
}

/// Entry point of a hardware backend: device discovery plus open/close of
/// cameras and displays.
pub trait CameraHal: Send + Sync {
    fn camera_list(&self) -> Vec<CameraDescriptor>;

    fn open_camera(&self, id: &str, config: &StreamConfig) -> EvsResult<Arc<dyn HwCamera>>;
    fn close_camera(&self, camera: Arc<dyn HwCamera>);

    fn display_id_list(&self) -> Vec<u8>;
    fn open_display(&self, id: u8) -> EvsResult<Arc<dyn HwDisplay>>;
    fn close_display(&self, display: Arc<dyn HwDisplay>);
}
