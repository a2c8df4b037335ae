//! Per-client camera facade.
//!
//! A `VirtualCamera` presents the full camera contract to exactly one
//! client while enforcing that client's buffer quota and isolating it from
//! the other clients multiplexed onto the same device. It holds strong
//! references to its source `HalCamera`s; the sources only hold weak
//! back-references, so dropping the facade never leaks the device.
//!
//! Methods here never call into a `HalCamera` while holding the facade's
//! own lock (see the lock-order note in `hal_camera`): state is snapshotted
//! first, the lock released, then the source is invoked.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, warn};

use crate::error::{EvsError, EvsResult};
use crate::frame::{BufferId, Frame};
use crate::hal::{
    BufferDesc, CameraDescriptor, CameraParam, CameraSink, EvsEvent, EvsEventKind, StreamConfig,
};
use crate::mux::enumerator::HalDisplay;
use crate::mux::hal_camera::HalCamera;
use crate::utils::lock_unpoisoned;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientStreamState {
    Stopped,
    Running,
    Stopping,
}

struct ClientState {
    /// Source cameras backing this facade; more than one for a logical
    /// camera. Emptied by `shutdown`, after which client calls fail.
    sources: Vec<Arc<HalCamera>>,
    stream_state: ClientStreamState,
    /// Frames held but not yet returned, per source camera, in arrival
    /// order.
    held: HashMap<String, VecDeque<Frame>>,
    /// This client's buffer quota.
    allowed_buffers: u32,
    sink: Option<Arc<dyn CameraSink>>,
}

pub struct VirtualCamera {
    /// Descriptor of the logical aggregate, when this facade spans several
    /// physical cameras.
    logical_desc: Option<CameraDescriptor>,
    state: Mutex<ClientState>,
}

impl VirtualCamera {
    pub(crate) fn new(
        sources: Vec<Arc<HalCamera>>,
        logical_desc: Option<CameraDescriptor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            logical_desc,
            state: Mutex::new(ClientState {
                sources,
                stream_state: ClientStreamState::Stopped,
                held: HashMap::new(),
                allowed_buffers: 1,
                sink: None,
            }),
        })
    }

    fn sources(&self) -> EvsResult<Vec<Arc<HalCamera>>> {
        let state = lock_unpoisoned(&self.state);
        if state.sources.is_empty() {
            return Err(EvsError::CameraNotAvailable("<shut down>".to_owned()));
        }
        Ok(state.sources.clone())
    }

    pub(crate) fn sources_snapshot(&self) -> Vec<Arc<HalCamera>> {
        lock_unpoisoned(&self.state).sources.clone()
    }

    pub fn allowed_buffers(&self) -> u32 {
        lock_unpoisoned(&self.state).allowed_buffers
    }

    /// Records a quota value a source camera accepted. Called by a
    /// `HalCamera` under its own lock as the commit step of a quota change;
    /// never call this from within one of our locked sections.
    pub(crate) fn commit_quota(&self, quota: u32) {
        lock_unpoisoned(&self.state).allowed_buffers = quota;
    }

    pub fn is_streaming(&self) -> bool {
        lock_unpoisoned(&self.state).stream_state == ClientStreamState::Running
    }

    /// Frames this client currently holds.
    pub fn frames_held(&self) -> usize {
        lock_unpoisoned(&self.state)
            .held
            .values()
            .map(VecDeque::len)
            .sum()
    }

    pub fn is_logical(&self) -> bool {
        self.logical_desc.is_some()
    }

    pub fn get_camera_info(&self) -> EvsResult<CameraDescriptor> {
        if let Some(desc) = &self.logical_desc {
            return Ok(desc.clone());
        }
        let sources = self.sources()?;
        Ok(sources[0].descriptor())
    }

    pub fn stream_config(&self) -> EvsResult<StreamConfig> {
        let sources = self.sources()?;
        Ok(sources[0].stream_config().clone())
    }

    /// Changes this client's buffer quota. Each source camera recomputes,
    /// pushes and commits the new value as one transaction under its own
    /// lock; if a later source rejects it, the ones that already accepted
    /// are told the previous value again, restoring their aggregates.
    pub fn set_max_frames_in_flight(self: &Arc<Self>, count: u32) -> EvsResult<()> {
        if count < 1 {
            return Err(EvsError::InvalidArg);
        }
        let (sources, previous) = {
            let state = lock_unpoisoned(&self.state);
            if state.sources.is_empty() {
                return Err(EvsError::CameraNotAvailable("<shut down>".to_owned()));
            }
            (state.sources.clone(), state.allowed_buffers)
        };
        if count == previous {
            return Ok(());
        }

        let mut applied: Vec<&Arc<HalCamera>> = Vec::new();
        for source in &sources {
            if let Err(e) = source.update_client_quota(self, count) {
                warn!(camera = %source.id(), "Buffer quota change rejected: {e}");
                for prior in applied {
                    if let Err(undo) = prior.update_client_quota(self, previous) {
                        error!(camera = %prior.id(), "Failed to restore the previous quota: {undo}");
                    }
                }
                return Err(e);
            }
            applied.push(source);
        }

        Ok(())
    }

    /// Starts this client's stream, registering `sink` for frame and event
    /// delivery. The first client to start also starts the hardware stream;
    /// a hardware failure rolls everything back and surfaces to the caller.
    pub fn start_video_stream(&self, sink: Arc<dyn CameraSink>) -> EvsResult<()> {
        let sources = {
            let mut state = lock_unpoisoned(&self.state);
            if state.sources.is_empty() {
                return Err(EvsError::CameraNotAvailable("<shut down>".to_owned()));
            }
            if state.stream_state != ClientStreamState::Stopped {
                warn!("Ignoring a request to start a stream that is already running");
                return Err(EvsError::StreamAlreadyRunning);
            }
            state.stream_state = ClientStreamState::Running;
            state.sink = Some(sink);
            state.sources.clone()
        };

        let mut started: Vec<&Arc<HalCamera>> = Vec::new();
        for source in &sources {
            if let Err(e) = source.client_stream_starting() {
                error!(camera = %source.id(), "Underlying device failed to start its stream: {e}");
                // Roll back: mark ourselves stopped first so the ending
                // calls below actually stop the hardware.
                {
                    let mut state = lock_unpoisoned(&self.state);
                    state.stream_state = ClientStreamState::Stopped;
                    state.sink = None;
                }
                for prior in started {
                    prior.client_stream_ending();
                }
                return Err(e);
            }
            started.push(source);
        }

        Ok(())
    }

    /// Stops this client's stream. Safe to call when not streaming. The
    /// client observes a terminal stream-stopped notification before the
    /// call returns; the hardware side winds down once no other client
    /// streams.
    pub fn stop_video_stream(&self) -> EvsResult<()> {
        let (sink, sources) = {
            let mut state = lock_unpoisoned(&self.state);
            if state.stream_state != ClientStreamState::Running {
                return Ok(());
            }
            state.stream_state = ClientStreamState::Stopping;
            // Taking the sink ends delivery for good; the terminal event
            // below is the last thing it sees.
            (state.sink.take(), state.sources.clone())
        };

        // Deliver the terminal notification synchronously; the client's
        // view of the stream ends here regardless of hardware timing.
        if let Some(sink) = &sink {
            sink.notify(EvsEvent::stream_stopped());
        }

        lock_unpoisoned(&self.state).stream_state = ClientStreamState::Stopped;

        for source in &sources {
            source.client_stream_ending();
        }

        Ok(())
    }

    /// Frame delivery from a source camera. Declines when stopped or at the
    /// buffer quota; that back-pressure is expected, not an error.
    pub(crate) fn deliver_frame(&self, frame: Frame) -> bool {
        let sink = {
            let mut state = lock_unpoisoned(&self.state);
            if state.stream_state != ClientStreamState::Running {
                return false;
            }
            let Some(sink) = state.sink.clone() else {
                return false;
            };
            let allowed = state.allowed_buffers as usize;
            let queue = state.held.entry(frame.source_id.clone()).or_default();
            if queue.len() >= allowed {
                debug!(
                    source = %frame.source_id,
                    held = queue.len(),
                    "Skipping a frame: client is at its buffer quota"
                );
                metrics::counter!("argus_frames_declined").increment(1);
                return false;
            }
            queue.push_back(frame.clone());
            sink
        };

        sink.deliver_frame(frame);
        true
    }

    /// Event delivery from a source camera. Returns false if the client has
    /// no registered sink.
    pub(crate) fn notify(&self, event: EvsEvent) -> bool {
        let sink = {
            let mut state = lock_unpoisoned(&self.state);
            if event.kind == EvsEventKind::StreamStopped {
                // The device is gone whatever our own state was; finalize
                // and retire the sink after this last event.
                state.stream_state = ClientStreamState::Stopped;
                state.sink.take()
            } else {
                state.sink.clone()
            }
        };

        match sink {
            Some(sink) => {
                sink.notify(event);
                true
            }
            None => false,
        }
    }

    /// Returns one held frame. Returning a frame we never delivered is a
    /// client protocol violation: logged, ledger untouched.
    pub fn done_with_frame(&self, buffer_id: BufferId) -> EvsResult<()> {
        let source = {
            let mut state = lock_unpoisoned(&self.state);
            let mut source_id = None;
            for (id, queue) in state.held.iter_mut() {
                if let Some(pos) = queue.iter().position(|f| f.buffer_id == buffer_id) {
                    queue.remove(pos);
                    source_id = Some(id.clone());
                    break;
                }
            }
            match source_id {
                Some(id) => state.sources.iter().find(|s| s.id() == id).cloned(),
                None => {
                    error!(buffer_id, "Client returned a frame it never received");
                    return Err(EvsError::InvalidArg);
                }
            }
        };

        if let Some(source) = source {
            source.done_with_frame(buffer_id);
        }
        Ok(())
    }

    /// Batch form of `done_with_frame`. Each invalid id is logged and
    /// skipped; valid ids in the same batch are still released.
    pub fn done_with_frames(&self, buffer_ids: &[BufferId]) -> EvsResult<()> {
        let mut result = Ok(());
        for &id in buffer_ids {
            if let Err(e) = self.done_with_frame(id) {
                result = Err(e);
            }
        }
        result
    }

    /// Claims the primary (parameter-writing) role on every source camera.
    pub fn set_primary_client(self: &Arc<Self>) -> EvsResult<()> {
        for source in self.sources()? {
            source.set_primary_client(self)?;
        }
        Ok(())
    }

    /// Takes the primary role by force. The caller proves its standing by
    /// presenting a live display handle; a superseded handle is refused.
    pub fn force_primary_client(self: &Arc<Self>, display: &Arc<HalDisplay>) -> EvsResult<()> {
        if !display.is_valid() {
            warn!("Refusing forcePrimaryClient with a superseded display handle");
            return Err(EvsError::OwnershipLost);
        }
        match display.state() {
            crate::hal::DisplayState::NotOpen | crate::hal::DisplayState::Dead => {
                return Err(EvsError::InvalidArg);
            }
            _ => {}
        }

        for source in self.sources()? {
            source.force_primary_client(self);
        }
        Ok(())
    }

    /// Releases the primary role; fails unless this client holds it.
    pub fn unset_primary_client(self: &Arc<Self>) -> EvsResult<()> {
        let mut result = Ok(());
        for source in self.sources()? {
            if let Err(e) = source.unset_primary_client(self) {
                result = Err(e);
            }
        }
        result
    }

    /// Writes a camera parameter on every source; requires the primary
    /// role. Returns the value the hardware settled on.
    pub fn set_parameter(self: &Arc<Self>, id: CameraParam, value: i32) -> EvsResult<i32> {
        let mut effective = value;
        for source in self.sources()? {
            effective = source.set_parameter(self, id, value)?;
        }
        Ok(effective)
    }

    pub fn get_parameter(&self, id: CameraParam) -> EvsResult<i32> {
        let sources = self.sources()?;
        sources[0].get_parameter(id)
    }

    pub fn get_parameter_list(&self) -> EvsResult<Vec<CameraParam>> {
        let sources = self.sources()?;
        Ok(sources[0].parameter_list())
    }

    pub fn set_extended_info(&self, opaque_id: u32, value: Vec<u8>) -> EvsResult<()> {
        for source in self.sources()? {
            source.set_extended_info(opaque_id, value.clone())?;
        }
        Ok(())
    }

    pub fn get_extended_info(&self, opaque_id: u32) -> EvsResult<Vec<u8>> {
        let sources = self.sources()?;
        sources[0].get_extended_info(opaque_id)
    }

    /// Offers externally allocated buffers to every source camera; returns
    /// the total count accepted.
    pub fn import_external_buffers(&self, buffers: Vec<BufferDesc>) -> EvsResult<u32> {
        let mut accepted = 0;
        for source in self.sources()? {
            accepted += source.import_external_buffers(buffers.clone())?;
        }
        Ok(accepted)
    }

    /// Final teardown: stops the stream, releases every held frame back to
    /// its source, and drops the source references. Idempotent; called by
    /// the enumerator on close and safe to call again afterwards.
    pub fn shutdown(&self) {
        if let Err(e) = self.stop_video_stream() {
            warn!("Error while stopping the stream during shutdown: {e}");
        }

        let (held, sources) = {
            let mut state = lock_unpoisoned(&self.state);
            state.sink = None;
            (
                std::mem::take(&mut state.held),
                std::mem::take(&mut state.sources),
            )
        };

        // Every held frame counts as one release; otherwise the shared
        // ledger would leak references the device can never reclaim.
        for (source_id, queue) in held {
            let Some(source) = sources.iter().find(|s| s.id() == source_id) else {
                continue;
            };
            for frame in queue {
                source.done_with_frame(frame.buffer_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mock::{MockCamera, MockHal};
    use crate::hal::CameraHal;
    use crate::mux::hal_camera::StreamState;

    struct TestSink {
        frames: Mutex<Vec<Frame>>,
        events: Mutex<Vec<EvsEvent>>,
    }

    impl TestSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                frames: Mutex::new(Vec::new()),
                events: Mutex::new(Vec::new()),
            })
        }

        fn frame_ids(&self) -> Vec<BufferId> {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .map(|f| f.buffer_id)
                .collect()
        }

        fn events(&self) -> Vec<EvsEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl CameraSink for TestSink {
        fn deliver_frame(&self, frame: Frame) {
            self.frames.lock().unwrap().push(frame);
        }

        fn notify(&self, event: EvsEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn setup() -> (Arc<MockHal>, Arc<MockCamera>, Arc<HalCamera>) {
        let hal = MockHal::with_physical(&["cam0"]);
        let hal_dyn: Arc<dyn CameraHal> = hal.clone();
        let hw = hal_dyn
            .open_camera("cam0", &StreamConfig::default())
            .unwrap();
        let camera = Arc::new(HalCamera::new(
            "cam0",
            hw,
            hal_dyn,
            StreamConfig::default(),
        ));
        let mock = hal.camera("cam0").unwrap();
        (hal, mock, camera)
    }

    #[test]
    fn declines_frames_beyond_its_quota() {
        let (_hal, mock, camera) = setup();
        let client = camera.make_virtual_camera().unwrap();
        let sink = TestSink::new();
        client.start_video_stream(sink.clone()).unwrap();

        let first = mock.inject_frame().unwrap();
        let _second = mock.inject_frame().unwrap();

        // Quota is 1: the second frame never reached the sink.
        assert_eq!(sink.frame_ids(), vec![first]);
        assert_eq!(client.frames_held(), 1);

        // Returning the held frame frees the quota again.
        client.done_with_frame(first).unwrap();
        let third = mock.inject_frame().unwrap();
        assert_eq!(sink.frame_ids(), vec![first, third]);
    }

    #[test]
    fn frames_arrive_in_order() {
        let (_hal, mock, camera) = setup();
        let client = camera.make_virtual_camera().unwrap();
        client.set_max_frames_in_flight(3).unwrap();
        let sink = TestSink::new();
        client.start_video_stream(sink.clone()).unwrap();

        let ids: Vec<_> = (0..3).map(|_| mock.inject_frame().unwrap()).collect();
        assert_eq!(sink.frame_ids(), ids);
    }

    #[test]
    fn returning_an_unknown_frame_is_an_error_but_harmless() {
        let (_hal, mock, camera) = setup();
        let client = camera.make_virtual_camera().unwrap();
        let sink = TestSink::new();
        client.start_video_stream(sink).unwrap();
        let id = mock.inject_frame().unwrap();

        assert_eq!(client.done_with_frame(id + 7), Err(EvsError::InvalidArg));
        assert_eq!(client.frames_held(), 1);
        assert!(mock.returned_buffers().is_empty());

        client.done_with_frame(id).unwrap();
        assert_eq!(mock.returned_buffers(), vec![id]);
    }

    #[test]
    fn start_twice_reports_already_running() {
        let (_hal, _mock, camera) = setup();
        let client = camera.make_virtual_camera().unwrap();
        client.start_video_stream(TestSink::new()).unwrap();
        assert_eq!(
            client.start_video_stream(TestSink::new()),
            Err(EvsError::StreamAlreadyRunning)
        );
    }

    #[test]
    fn stop_when_not_streaming_is_a_noop() {
        let (_hal, mock, camera) = setup();
        let client = camera.make_virtual_camera().unwrap();
        client.stop_video_stream().unwrap();
        assert_eq!(mock.stop_calls(), 0);
    }

    #[test]
    fn stop_delivers_a_terminal_notification() {
        let (_hal, _mock, camera) = setup();
        let client = camera.make_virtual_camera().unwrap();
        let sink = TestSink::new();
        client.start_video_stream(sink.clone()).unwrap();
        client.stop_video_stream().unwrap();

        assert!(sink
            .events()
            .iter()
            .any(|e| e.kind == EvsEventKind::StreamStopped));
        assert!(!client.is_streaming());
    }

    #[test]
    fn start_failure_rolls_back_to_stopped() {
        let (_hal, mock, camera) = setup();
        let client = camera.make_virtual_camera().unwrap();
        mock.set_fail_start(true);

        assert!(client.start_video_stream(TestSink::new()).is_err());
        assert!(!client.is_streaming());
        assert_eq!(camera.stream_state(), StreamState::Stopped);

        // Recovers once the device does.
        mock.set_fail_start(false);
        client.start_video_stream(TestSink::new()).unwrap();
        assert!(client.is_streaming());
    }

    #[test]
    fn quota_change_failure_leaves_quota_untouched() {
        let (_hal, mock, camera) = setup();
        let client = camera.make_virtual_camera().unwrap();
        mock.set_fail_quota(true);

        assert!(client.set_max_frames_in_flight(5).is_err());
        assert_eq!(client.allowed_buffers(), 1);

        mock.set_fail_quota(false);
        client.set_max_frames_in_flight(5).unwrap();
        assert_eq!(client.allowed_buffers(), 5);
    }

    #[test]
    fn shutdown_releases_held_frames_and_is_idempotent() {
        let (_hal, mock, camera) = setup();
        let client = camera.make_virtual_camera().unwrap();
        client.start_video_stream(TestSink::new()).unwrap();
        let id = mock.inject_frame().unwrap();
        assert!(mock.returned_buffers().is_empty());

        client.shutdown();
        assert_eq!(mock.returned_buffers(), vec![id]);
        assert_eq!(client.frames_held(), 0);

        client.shutdown();
        assert_eq!(mock.returned_buffers(), vec![id]);

        // A shut-down handle refuses further work.
        assert!(matches!(
            client.get_camera_info(),
            Err(EvsError::CameraNotAvailable(_))
        ));
    }
}
