//! V4L2 hardware backend.
//!
//! Adapts Linux V4L2 capture devices to the [`CameraHal`] contract: a
//! capture thread dequeues memory-mapped buffers from the device and pushes
//! them through the registered sink. Outstanding frames are tracked in a
//! bounded slot pool sized by `set_max_frames_in_flight`; when every slot is
//! taken the capture thread drops frames until a client returns one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::utils::CachePadded;
use tracing::{error, info, warn};
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::error::{EvsError, EvsResult};
use crate::frame::{BufferId, Frame, FrameMetadata, PixelFormat};
use crate::hal::{
    BufferDesc, CameraDescriptor, CameraHal, CameraParam, CameraSink, HwCamera, HwDisplay,
    StreamConfig,
};
use crate::utils::{detect_devices, lock_unpoisoned};

// V4L2 user and camera class control ids.
const CID_BRIGHTNESS: u32 = 0x0098_0900;
const CID_CONTRAST: u32 = 0x0098_0901;
const CID_AUTO_WHITE_BALANCE: u32 = 0x0098_090c;
const CID_AUTOGAIN: u32 = 0x0098_0912;
const CID_GAIN: u32 = 0x0098_0913;
const CID_WHITE_BALANCE_TEMPERATURE: u32 = 0x0098_091a;
const CID_SHARPNESS: u32 = 0x0098_091b;
const CID_EXPOSURE_AUTO: u32 = 0x009a_0901;
const CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;
const CID_FOCUS_ABSOLUTE: u32 = 0x009a_090a;
const CID_FOCUS_AUTO: u32 = 0x009a_090c;
const CID_ZOOM_ABSOLUTE: u32 = 0x009a_090d;

fn control_id(param: CameraParam) -> u32 {
    match param {
        CameraParam::Brightness => CID_BRIGHTNESS,
        CameraParam::Contrast => CID_CONTRAST,
        CameraParam::AutoWhiteBalance => CID_AUTO_WHITE_BALANCE,
        CameraParam::AutoGain => CID_AUTOGAIN,
        CameraParam::Gain => CID_GAIN,
        CameraParam::WhiteBalanceTemperature => CID_WHITE_BALANCE_TEMPERATURE,
        CameraParam::Sharpness => CID_SHARPNESS,
        CameraParam::AutoExposure => CID_EXPOSURE_AUTO,
        CameraParam::AbsoluteExposure => CID_EXPOSURE_ABSOLUTE,
        CameraParam::AbsoluteFocus => CID_FOCUS_ABSOLUTE,
        CameraParam::AutoFocus => CID_FOCUS_AUTO,
        CameraParam::AbsoluteZoom => CID_ZOOM_ABSOLUTE,
    }
}

const ALL_PARAMS: [CameraParam; 12] = [
    CameraParam::Brightness,
    CameraParam::Contrast,
    CameraParam::AutoWhiteBalance,
    CameraParam::AutoGain,
    CameraParam::Gain,
    CameraParam::WhiteBalanceTemperature,
    CameraParam::Sharpness,
    CameraParam::AutoExposure,
    CameraParam::AbsoluteExposure,
    CameraParam::AbsoluteFocus,
    CameraParam::AutoFocus,
    CameraParam::AbsoluteZoom,
];

fn hw_err(e: impl std::fmt::Display) -> EvsError {
    EvsError::Hardware(e.to_string())
}

/// Hardware enumerator over the local V4L2 capture devices.
pub struct V4l2Hal {
    descriptors: Vec<CameraDescriptor>,
}

impl V4l2Hal {
    /// Scans for capture devices; fails when none are usable.
    pub fn new() -> EvsResult<Arc<Self>> {
        let found = detect_devices();
        if found.is_empty() {
            return Err(EvsError::CameraNotAvailable(
                "no V4L2 capture device found".to_owned(),
            ));
        }
        let descriptors = found
            .iter()
            .map(|dev| CameraDescriptor::physical(dev.path.clone()))
            .collect();
        Ok(Arc::new(Self { descriptors }))
    }
}

impl CameraHal for V4l2Hal {
    fn camera_list(&self) -> Vec<CameraDescriptor> {
        self.descriptors.clone()
    }

    fn open_camera(&self, id: &str, config: &StreamConfig) -> EvsResult<Arc<dyn HwCamera>> {
        if !self.descriptors.iter().any(|d| d.id == id) {
            return Err(EvsError::CameraNotAvailable(id.to_owned()));
        }
        let camera = V4l2Camera::open(id, config.clone())?;
        Ok(camera)
    }

    fn close_camera(&self, camera: Arc<dyn HwCamera>) {
        // The device node closes when the wrapper drops; just make sure the
        // capture thread is down.
        camera.stop_video_stream();
    }

    fn display_id_list(&self) -> Vec<u8> {
        Vec::new()
    }

    fn open_display(&self, _id: u8) -> EvsResult<Arc<dyn HwDisplay>> {
        Err(EvsError::NotSupported)
    }

    fn close_display(&self, _display: Arc<dyn HwDisplay>) {
        warn!("This backend has no display to close");
    }
}

#[derive(Default)]
struct CaptureStats {
    frames_captured: AtomicU64,
    frames_dropped: AtomicU64,
}

struct CamState {
    sink: Option<Arc<dyn CameraSink>>,
    running: bool,
    /// In-use flag per buffer slot; a slot index doubles as the buffer id.
    slots: Vec<bool>,
    extended: HashMap<u32, Vec<u8>>,
    sequence: u64,
}

struct CamShared {
    state: Mutex<CamState>,
    stop: AtomicBool,
    stats: CachePadded<CaptureStats>,
}

/// One V4L2 capture device.
pub struct V4l2Camera {
    desc: CameraDescriptor,
    path: String,
    config: StreamConfig,
    shared: Arc<CamShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl V4l2Camera {
    fn open(path: &str, config: StreamConfig) -> EvsResult<Arc<Self>> {
        info!(device = path, "Initializing V4L2 capture");

        // Probe the device up front so open failures surface here, not on
        // the capture thread.
        let device = Device::with_path(path).map_err(hw_err)?;
        let caps = device.query_caps().map_err(hw_err)?;
        info!("Device: {} ({})", caps.card, caps.driver);
        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Err(EvsError::Hardware(
                "device doesn't support video capture".to_owned(),
            ));
        }

        Ok(Arc::new(Self {
            desc: CameraDescriptor::physical(path),
            path: path.to_owned(),
            config,
            shared: Arc::new(CamShared {
                state: Mutex::new(CamState {
                    sink: None,
                    running: false,
                    slots: vec![false],
                    extended: HashMap::new(),
                    sequence: 0,
                }),
                stop: AtomicBool::new(false),
                stats: CachePadded::new(CaptureStats::default()),
            }),
            worker: Mutex::new(None),
        }))
    }

    fn configure_device(&self, device: &Device) -> EvsResult<()> {
        let mut fmt = device.format().map_err(hw_err)?;
        fmt.width = self.config.width;
        fmt.height = self.config.height;
        fmt.fourcc = match self.config.format {
            PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
            PixelFormat::Yuyv4 => FourCC::new(b"YUYV"),
            _ => return Err(EvsError::NotSupported),
        };
        device.set_format(&fmt).map_err(hw_err)?;
        Ok(())
    }

    pub fn frames_dropped(&self) -> u64 {
        self.shared.stats.frames_dropped.load(Ordering::Relaxed)
    }
}

fn capture_loop(
    shared: Arc<CamShared>,
    device: Device,
    config: StreamConfig,
    source_id: String,
    sink: Arc<dyn CameraSink>,
) {
    let mut stream = match MmapStream::with_buffers(&device, Type::VideoCapture, 4) {
        Ok(stream) => stream,
        Err(e) => {
            error!(device = %source_id, "Failed to map capture buffers: {e}");
            sink.notify(crate::hal::EvsEvent::stream_stopped());
            lock_unpoisoned(&shared.state).running = false;
            return;
        }
    };

    while !shared.stop.load(Ordering::Acquire) {
        let (buf, meta) = match stream.next() {
            Ok(pair) => pair,
            Err(e) => {
                error!(device = %source_id, "Capture error: {e}");
                break;
            }
        };

        let timestamp = Instant::now();
        let (buffer_id, sequence) = {
            let mut state = lock_unpoisoned(&shared.state);
            state.sequence += 1;
            match state.slots.iter().position(|in_use| !in_use) {
                Some(idx) => {
                    state.slots[idx] = true;
                    (idx as BufferId, state.sequence)
                }
                None => {
                    // Every slot is outstanding; the consumers own the pool.
                    shared.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("argus_capture_dropped").increment(1);
                    continue;
                }
            }
        };

        shared.stats.frames_captured.fetch_add(1, Ordering::Relaxed);
        sink.deliver_frame(Frame {
            buffer_id,
            source_id: source_id.clone(),
            data: Bytes::copy_from_slice(buf),
            meta: Arc::new(FrameMetadata {
                sequence,
                width: config.width,
                height: config.height,
                stride: config.width,
                format: config.format,
                device_timestamp: Some(
                    Duration::from_secs(meta.timestamp.sec as u64)
                        + Duration::from_micros(meta.timestamp.usec as u64),
                ),
            }),
            timestamp,
        });
    }

    sink.notify(crate::hal::EvsEvent::stream_stopped());
    lock_unpoisoned(&shared.state).running = false;
}

impl HwCamera for V4l2Camera {
    fn descriptor(&self) -> CameraDescriptor {
        self.desc.clone()
    }

    fn start_video_stream(&self, sink: Arc<dyn CameraSink>) -> EvsResult<()> {
        {
            let mut state = lock_unpoisoned(&self.shared.state);
            if state.running {
                return Err(EvsError::StreamAlreadyRunning);
            }
            state.running = true;
            state.sink = Some(sink.clone());
        }
        self.shared.stop.store(false, Ordering::Release);

        let device = match Device::with_path(&self.path) {
            Ok(device) => device,
            Err(e) => {
                lock_unpoisoned(&self.shared.state).running = false;
                return Err(hw_err(e));
            }
        };
        if let Err(e) = self.configure_device(&device) {
            lock_unpoisoned(&self.shared.state).running = false;
            return Err(e);
        }

        let shared = self.shared.clone();
        let config = self.config.clone();
        let source_id = self.path.clone();
        let handle = std::thread::Builder::new()
            .name(format!("v4l2-capture-{}", self.path.replace('/', "_")))
            .spawn(move || capture_loop(shared, device, config, source_id, sink))
            .map_err(|e| {
                lock_unpoisoned(&self.shared.state).running = false;
                hw_err(e)
            })?;
        *lock_unpoisoned(&self.worker) = Some(handle);

        info!(device = %self.path, "Capture stream started");
        Ok(())
    }

    fn stop_video_stream(&self) {
        self.shared.stop.store(true, Ordering::Release);
        let handle = lock_unpoisoned(&self.worker).take();
        if let Some(handle) = handle {
            // Bounded by one frame interval; the loop re-checks the flag
            // after every dequeue.
            if handle.join().is_err() {
                error!(device = %self.path, "Capture thread panicked");
            }
        }
        lock_unpoisoned(&self.shared.state).sink = None;
    }

    fn done_with_frame(&self, buffer_id: BufferId) {
        let mut state = lock_unpoisoned(&self.shared.state);
        match state.slots.get_mut(buffer_id as usize) {
            Some(in_use) if *in_use => *in_use = false,
            Some(_) => error!(
                device = %self.path,
                buffer_id,
                "Ignoring doneWithFrame on a frame which is already free"
            ),
            None => error!(
                device = %self.path,
                buffer_id,
                "Ignoring doneWithFrame with an invalid buffer id"
            ),
        }
    }

    fn set_max_frames_in_flight(&self, count: u32) -> EvsResult<()> {
        if count < 1 {
            return Err(EvsError::InvalidArg);
        }
        let mut state = lock_unpoisoned(&self.shared.state);
        let count = count as usize;
        if count >= state.slots.len() {
            state.slots.resize(count, false);
            return Ok(());
        }
        // Shrinking: only allowed when no outstanding frame occupies a slot
        // beyond the new capacity.
        if state.slots[count..].iter().any(|in_use| *in_use) {
            return Err(EvsError::BufferNotAvailable);
        }
        state.slots.truncate(count);
        Ok(())
    }

    fn set_parameter(&self, id: CameraParam, value: i32) -> EvsResult<i32> {
        let device = Device::with_path(&self.path).map_err(hw_err)?;
        let cid = control_id(id);
        device
            .set_control(v4l::Control {
                id: cid,
                value: v4l::control::Value::Integer(value as i64),
            })
            .map_err(hw_err)?;
        // Read back what the driver settled on after clamping.
        self.get_parameter(id)
    }

    fn get_parameter(&self, id: CameraParam) -> EvsResult<i32> {
        let device = Device::with_path(&self.path).map_err(hw_err)?;
        let control = device.control(control_id(id)).map_err(hw_err)?;
        match control.value {
            v4l::control::Value::Integer(v) => Ok(v as i32),
            v4l::control::Value::Boolean(v) => Ok(v as i32),
            _ => Err(EvsError::NotSupported),
        }
    }

    fn parameter_list(&self) -> Vec<CameraParam> {
        let Ok(device) = Device::with_path(&self.path) else {
            return Vec::new();
        };
        let Ok(descriptions) = device.query_controls() else {
            return Vec::new();
        };
        ALL_PARAMS
            .into_iter()
            .filter(|p| descriptions.iter().any(|d| d.id == control_id(*p)))
            .collect()
    }

    fn set_extended_info(&self, opaque_id: u32, value: Vec<u8>) -> EvsResult<()> {
        lock_unpoisoned(&self.shared.state)
            .extended
            .insert(opaque_id, value);
        Ok(())
    }

    fn get_extended_info(&self, opaque_id: u32) -> EvsResult<Vec<u8>> {
        lock_unpoisoned(&self.shared.state)
            .extended
            .get(&opaque_id)
            .cloned()
            .ok_or(EvsError::InvalidArg)
    }

    fn import_external_buffers(&self, _buffers: Vec<BufferDesc>) -> EvsResult<u32> {
        // V4L2 manages its own mmap pool; externally allocated buffers
        // cannot be registered with it.
        Err(EvsError::NotSupported)
    }
}
