//! In-memory hardware backend.
//!
//! Every hardware-facing call is recorded so tests can assert exactly what
//! the multiplexing layer asked the device to do, and each failure path can
//! be armed individually. The demo binary also runs on this backend when no
//! real capture device is configured.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use tracing::debug;

use crate::error::{EvsError, EvsResult};
use crate::frame::{BufferId, Frame, FrameMetadata, PixelFormat};
use crate::hal::{
    BufferDesc, CameraDescriptor, CameraHal, CameraParam, CameraSink, DisplayState, EvsEvent,
    EvsEventKind, HwCamera, HwDisplay, StreamConfig,
};
use crate::utils::lock_unpoisoned;

/// Fake hardware enumerator over a fixed set of camera descriptors.
pub struct MockHal {
    state: Mutex<MockHalState>,
}

struct MockHalState {
    descriptors: Vec<CameraDescriptor>,
    cameras: HashMap<String, Arc<MockCamera>>,
    open_failures: u32,
    closed: HashMap<String, u32>,
    display: Option<Arc<MockDisplay>>,
    display_closed: u32,
}

impl MockHal {
    pub fn new(descriptors: Vec<CameraDescriptor>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockHalState {
                descriptors,
                cameras: HashMap::new(),
                open_failures: 0,
                closed: HashMap::new(),
                display: None,
                display_closed: 0,
            }),
        })
    }

    /// Convenience constructor for a set of plain physical cameras.
    pub fn with_physical(ids: &[&str]) -> Arc<Self> {
        Self::new(ids.iter().map(|id| CameraDescriptor::physical(*id)).collect())
    }

    /// Arms the next `count` calls to `open_camera` to fail.
    pub fn fail_next_opens(&self, count: u32) {
        lock_unpoisoned(&self.state).open_failures = count;
    }

    /// The live hardware camera behind `id`, if one is open. Tests use this
    /// handle to inject frames and inspect call counters.
    pub fn camera(&self, id: &str) -> Option<Arc<MockCamera>> {
        lock_unpoisoned(&self.state).cameras.get(id).cloned()
    }

    /// How many times `close_camera` was issued for `id`.
    pub fn closed_count(&self, id: &str) -> u32 {
        lock_unpoisoned(&self.state)
            .closed
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    pub fn display_closed_count(&self) -> u32 {
        lock_unpoisoned(&self.state).display_closed
    }
}

impl CameraHal for MockHal {
    fn camera_list(&self) -> Vec<CameraDescriptor> {
        lock_unpoisoned(&self.state).descriptors.clone()
    }

    fn open_camera(&self, id: &str, config: &StreamConfig) -> EvsResult<Arc<dyn HwCamera>> {
        let mut state = lock_unpoisoned(&self.state);
        if state.open_failures > 0 {
            state.open_failures -= 1;
            return Err(EvsError::Hardware(format!("injected open failure for {id}")));
        }
        let desc = state
            .descriptors
            .iter()
            .find(|d| d.id == id && !d.is_logical())
            .cloned()
            .ok_or_else(|| EvsError::CameraNotAvailable(id.to_owned()))?;
        if state.cameras.contains_key(id) {
            // The enumerator is supposed to reuse its wrapper instead.
            return Err(EvsError::Hardware(format!("{id} is already open")));
        }
        let camera = Arc::new(MockCamera::new(desc, config.clone()));
        state.cameras.insert(id.to_owned(), camera.clone());
        debug!(id, "mock camera opened");
        Ok(camera)
    }

    fn close_camera(&self, camera: Arc<dyn HwCamera>) {
        let id = camera.descriptor().id;
        let mut state = lock_unpoisoned(&self.state);
        state.cameras.remove(&id);
        *state.closed.entry(id.clone()).or_insert(0) += 1;
        debug!(id, "mock camera closed");
    }

    fn display_id_list(&self) -> Vec<u8> {
        vec![0]
    }

    fn open_display(&self, id: u8) -> EvsResult<Arc<dyn HwDisplay>> {
        let mut state = lock_unpoisoned(&self.state);
        let display = Arc::new(MockDisplay {
            id,
            state: Mutex::new(DisplayState::NotVisible),
        });
        if let Some(prev) = state.display.replace(display.clone()) {
            *lock_unpoisoned(&prev.state) = DisplayState::Dead;
        }
        Ok(display)
    }

    fn close_display(&self, display: Arc<dyn HwDisplay>) {
        let mut state = lock_unpoisoned(&self.state);
        state.display_closed += 1;
        if let Some(cur) = &state.display {
            if cur.id() == display.id() {
                state.display = None;
            }
        }
    }
}

#[derive(Default)]
struct MockCameraState {
    sink: Option<Arc<dyn CameraSink>>,
    streaming: bool,
    max_frames: u32,
    next_buffer: BufferId,
    sequence: u64,
    returned: Vec<BufferId>,
    params: HashMap<CameraParam, i32>,
    extended: HashMap<u32, Vec<u8>>,
    start_calls: u32,
    stop_calls: u32,
    quota_history: Vec<u32>,
    fail_quota: bool,
    fail_start: bool,
    fail_param: bool,
}

/// One fake camera device. Frames are injected by the test driving it.
pub struct MockCamera {
    desc: CameraDescriptor,
    config: StreamConfig,
    state: Mutex<MockCameraState>,
}

impl MockCamera {
    fn new(desc: CameraDescriptor, config: StreamConfig) -> Self {
        Self {
            desc,
            config,
            state: Mutex::new(MockCameraState {
                max_frames: 1,
                ..Default::default()
            }),
        }
    }

    fn sink(&self) -> Option<Arc<dyn CameraSink>> {
        let state = lock_unpoisoned(&self.state);
        if state.streaming {
            state.sink.clone()
        } else {
            None
        }
    }

    /// Pushes one frame through the registered sink, as the device's
    /// delivery thread would. Returns the buffer id used, or `None` if the
    /// stream is not running.
    pub fn inject_frame(&self) -> Option<BufferId> {
        let (buffer_id, sequence) = {
            let mut state = lock_unpoisoned(&self.state);
            if !state.streaming {
                return None;
            }
            state.next_buffer += 1;
            state.sequence += 1;
            (state.next_buffer, state.sequence)
        };
        self.inject_frame_with_id(buffer_id, sequence)
            .then_some(buffer_id)
    }

    /// Pushes a frame with a caller-chosen buffer id.
    pub fn inject_frame_with_id(&self, buffer_id: BufferId, sequence: u64) -> bool {
        let Some(sink) = self.sink() else {
            return false;
        };
        let meta = Arc::new(FrameMetadata {
            sequence,
            width: self.config.width,
            height: self.config.height,
            stride: self.config.width,
            format: PixelFormat::Rgb24,
            device_timestamp: None,
        });
        sink.deliver_frame(Frame {
            buffer_id,
            source_id: self.desc.id.clone(),
            data: Bytes::from_static(&[0u8; 16]),
            meta,
            timestamp: Instant::now(),
        });
        true
    }

    /// Pushes an arbitrary event through the registered sink.
    pub fn inject_event(&self, event: EvsEvent) -> bool {
        let sink = lock_unpoisoned(&self.state).sink.clone();
        match sink {
            Some(sink) => {
                sink.notify(event);
                true
            }
            None => false,
        }
    }

    pub fn set_fail_quota(&self, fail: bool) {
        lock_unpoisoned(&self.state).fail_quota = fail;
    }

    pub fn set_fail_start(&self, fail: bool) {
        lock_unpoisoned(&self.state).fail_start = fail;
    }

    pub fn set_fail_param(&self, fail: bool) {
        lock_unpoisoned(&self.state).fail_param = fail;
    }

    pub fn is_streaming(&self) -> bool {
        lock_unpoisoned(&self.state).streaming
    }

    pub fn start_calls(&self) -> u32 {
        lock_unpoisoned(&self.state).start_calls
    }

    pub fn stop_calls(&self) -> u32 {
        lock_unpoisoned(&self.state).stop_calls
    }

    /// Every buffer count pushed via `set_max_frames_in_flight`, in order.
    pub fn quota_history(&self) -> Vec<u32> {
        lock_unpoisoned(&self.state).quota_history.clone()
    }

    pub fn last_quota(&self) -> Option<u32> {
        lock_unpoisoned(&self.state).quota_history.last().copied()
    }

    /// Buffers returned to the device, in return order.
    pub fn returned_buffers(&self) -> Vec<BufferId> {
        lock_unpoisoned(&self.state).returned.clone()
    }
}

impl HwCamera for MockCamera {
    fn descriptor(&self) -> CameraDescriptor {
        self.desc.clone()
    }

    fn start_video_stream(&self, sink: Arc<dyn CameraSink>) -> EvsResult<()> {
        let mut state = lock_unpoisoned(&self.state);
        state.start_calls += 1;
        if state.fail_start {
            return Err(EvsError::Hardware("injected start failure".into()));
        }
        state.streaming = true;
        state.sink = Some(sink);
        Ok(())
    }

    fn stop_video_stream(&self) {
        let sink = {
            let mut state = lock_unpoisoned(&self.state);
            state.stop_calls += 1;
            if !state.streaming {
                return;
            }
            state.streaming = false;
            // Drop our reference to the sink; holding on to it would keep
            // the consumer side alive past the stream's end.
            state.sink.take()
        };
        // Real devices confirm the stop from their delivery thread; here the
        // terminal event arrives synchronously.
        if let Some(sink) = sink {
            sink.notify(EvsEvent::new(EvsEventKind::StreamStopped));
        }
    }

    fn done_with_frame(&self, buffer_id: BufferId) {
        lock_unpoisoned(&self.state).returned.push(buffer_id);
    }

    fn set_max_frames_in_flight(&self, count: u32) -> EvsResult<()> {
        let mut state = lock_unpoisoned(&self.state);
        if state.fail_quota {
            return Err(EvsError::BufferNotAvailable);
        }
        if count < 1 {
            return Err(EvsError::InvalidArg);
        }
        state.max_frames = count;
        state.quota_history.push(count);
        Ok(())
    }

    fn set_parameter(&self, id: CameraParam, value: i32) -> EvsResult<i32> {
        let mut state = lock_unpoisoned(&self.state);
        if state.fail_param {
            return Err(EvsError::Hardware("injected parameter failure".into()));
        }
        state.params.insert(id, value);
        Ok(value)
    }

    fn get_parameter(&self, id: CameraParam) -> EvsResult<i32> {
        Ok(lock_unpoisoned(&self.state)
            .params
            .get(&id)
            .copied()
            .unwrap_or(0))
    }

    fn parameter_list(&self) -> Vec<CameraParam> {
        vec![
            CameraParam::Brightness,
            CameraParam::Contrast,
            CameraParam::Gain,
            CameraParam::Sharpness,
        ]
    }

    fn set_extended_info(&self, opaque_id: u32, value: Vec<u8>) -> EvsResult<()> {
        lock_unpoisoned(&self.state).extended.insert(opaque_id, value);
        Ok(())
    }

    fn get_extended_info(&self, opaque_id: u32) -> EvsResult<Vec<u8>> {
        lock_unpoisoned(&self.state)
            .extended
            .get(&opaque_id)
            .cloned()
            .ok_or(EvsError::InvalidArg)
    }

    fn import_external_buffers(&self, buffers: Vec<BufferDesc>) -> EvsResult<u32> {
        // The fake device has no allocator of its own; it accepts everything.
        Ok(buffers.len() as u32)
    }
}

/// One fake display device.
pub struct MockDisplay {
    id: u8,
    state: Mutex<DisplayState>,
}

impl HwDisplay for MockDisplay {
    fn id(&self) -> u8 {
        self.id
    }

    fn state(&self) -> DisplayState {
        *lock_unpoisoned(&self.state)
    }
}
