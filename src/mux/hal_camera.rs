//! Hardware camera wrapper: one real device, N client facades.
//!
//! `HalCamera` is the single owner of a hardware camera handle. It fans
//! every delivered frame out to the virtual cameras that share the device,
//! keeps the reference-counted ledger of in-flight buffers, aggregates the
//! per-client buffer quotas into the one count pushed to hardware, and
//! arbitrates which client holds the primary (parameter-writing) role.
//!
//! Lock order: a `HalCamera` lock may be held while taking a
//! `VirtualCamera` lock (fan-out path); the reverse is forbidden. Virtual
//! cameras snapshot what they need under their own lock, release it, and
//! only then call back in here.

use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, error, info, warn};

use crate::error::{EvsError, EvsResult};
use crate::frame::{BufferId, Frame};
use crate::hal::{
    CameraDescriptor, CameraHal, CameraParam, CameraSink, EvsEvent, EvsEventKind, HwCamera,
    StreamConfig,
};
use crate::mux::virtual_camera::VirtualCamera;
use crate::utils::lock_unpoisoned;

/// Reference count of one in-flight frame buffer.
#[derive(Debug, Clone, Copy)]
struct FrameRecord {
    frame_id: BufferId,
    ref_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Stopped,
    Running,
    Stopping,
}

struct CameraState {
    /// Owned clients. Non-owning on purpose: a client's destruction must
    /// never be held up by the device that feeds it, and every iteration
    /// tolerates entries whose backing object is already gone.
    clients: Vec<Weak<VirtualCamera>>,
    /// Ledger of frames currently fanned out to at least one client. Slots
    /// with a zero count are recycled in place.
    frames: Vec<FrameRecord>,
    stream_state: StreamState,
}

pub struct HalCamera {
    id: String,
    hw: Arc<dyn HwCamera>,
    hal: Arc<dyn CameraHal>,
    stream_config: StreamConfig,
    state: Mutex<CameraState>,
    /// Back-reference only; never extends the primary client's lifetime.
    primary: Mutex<Weak<VirtualCamera>>,
}

impl HalCamera {
    pub fn new(
        id: impl Into<String>,
        hw: Arc<dyn HwCamera>,
        hal: Arc<dyn CameraHal>,
        stream_config: StreamConfig,
    ) -> Self {
        Self {
            id: id.into(),
            hw,
            hal,
            stream_config,
            state: Mutex::new(CameraState {
                clients: Vec::new(),
                frames: Vec::new(),
                stream_state: StreamState::Stopped,
            }),
            primary: Mutex::new(Weak::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stream_config(&self) -> &StreamConfig {
        &self.stream_config
    }

    pub fn descriptor(&self) -> CameraDescriptor {
        self.hw.descriptor()
    }

    pub fn stream_state(&self) -> StreamState {
        lock_unpoisoned(&self.state).stream_state
    }

    /// Number of owned clients that are still alive.
    pub fn client_count(&self) -> usize {
        lock_unpoisoned(&self.state)
            .clients
            .iter()
            .filter(|c| c.upgrade().is_some())
            .count()
    }

    /// Frames currently fanned out to at least one client.
    pub fn frames_in_flight(&self) -> usize {
        lock_unpoisoned(&self.state)
            .frames
            .iter()
            .filter(|r| r.ref_count > 0)
            .count()
    }

    /// Creates a new client facade bound to this camera. Fails if the
    /// aggregate buffer quota including the new client is rejected by the
    /// hardware; the partially constructed client is discarded.
    pub fn make_virtual_camera(self: &Arc<Self>) -> EvsResult<Arc<VirtualCamera>> {
        let client = VirtualCamera::new(vec![self.clone()], None);
        self.own_virtual_camera(&client)?;
        Ok(client)
    }

    /// Adds `client` to the owned list after reserving its buffer quota with
    /// the hardware. The quota push and the list insertion happen under one
    /// lock so a concurrent quota change cannot observe a half-added client.
    pub fn own_virtual_camera(&self, client: &Arc<VirtualCamera>) -> EvsResult<()> {
        let mut state = lock_unpoisoned(&self.state);
        if let Err(e) = self.change_frames_locked(&mut state, client.allowed_buffers() as i64) {
            error!(camera = %self.id, "Not enough buffers available for a new client: {e}");
            return Err(e);
        }
        state.clients.push(Arc::downgrade(client));
        Ok(())
    }

    /// Removes `client` from the owned list, stopping its stream first and
    /// releasing its share of the aggregate buffer quota. Unknown clients
    /// are a logged no-op.
    pub fn disown_virtual_camera(&self, client: &Arc<VirtualCamera>) {
        // Stop the client's stream before taking our lock; the stop path
        // calls back into clientStreamEnding.
        if let Err(e) = client.stop_video_stream() {
            warn!(camera = %self.id, "Failed to stop a disowned client's stream: {e}");
        }

        let mut state = lock_unpoisoned(&self.state);
        let mut found = false;
        state.clients.retain(|c| match c.upgrade() {
            Some(live) => {
                if Arc::ptr_eq(&live, client) {
                    found = true;
                    false
                } else {
                    true
                }
            }
            // Prune entries whose backing object is already gone.
            None => false,
        });
        if !found {
            warn!(camera = %self.id, "Couldn't find client in our list to remove it");
        }

        // Recompute the aggregate quota without the departed client. The
        // floor of one buffer keeps the hardware stream viable even with
        // zero clients.
        if let Err(e) = self.change_frames_locked(&mut state, 0) {
            error!(camera = %self.id, "Error while trying to reduce the in-flight buffer count: {e}");
        }
    }

    /// Sets `client`'s buffer quota. The aggregate is recomputed with the
    /// new value substituted for that client, pushed to the hardware, and
    /// the client's own quota committed, all under this camera's lock, so
    /// two concurrent quota changes serialize here and neither can compute
    /// from a stale value. On hardware rejection nothing changes.
    pub fn update_client_quota(
        &self,
        client: &Arc<VirtualCamera>,
        quota: u32,
    ) -> EvsResult<()> {
        let mut state = lock_unpoisoned(&self.state);

        let mut found = false;
        let mut buffer_count: i64 = 0;
        for c in state.clients.iter().filter_map(Weak::upgrade) {
            if Arc::ptr_eq(&c, client) {
                found = true;
                buffer_count += quota as i64;
            } else {
                buffer_count += c.allowed_buffers() as i64;
            }
        }
        if !found {
            warn!(camera = %self.id, "Quota change for a client this camera doesn't own");
            return Err(EvsError::InvalidArg);
        }

        self.push_frame_quota(&mut state, buffer_count)?;
        client.commit_quota(quota);
        Ok(())
    }

    fn change_frames_locked(&self, state: &mut CameraState, delta: i64) -> EvsResult<()> {
        let buffer_count: i64 = state
            .clients
            .iter()
            .filter_map(Weak::upgrade)
            .map(|c| c.allowed_buffers() as i64)
            .sum();
        self.push_frame_quota(state, buffer_count + delta)
    }

    fn push_frame_quota(&self, state: &mut CameraState, buffer_count: i64) -> EvsResult<()> {
        // Never drop below 1 buffer, even if all client cameras get closed
        let buffer_count = buffer_count.max(1);

        self.hw.set_max_frames_in_flight(buffer_count as u32)?;

        // Compact the ledger: drop the records no one references anymore,
        // keep everything still in flight.
        state.frames.retain(|r| r.ref_count > 0);
        if state.frames.len() as i64 > buffer_count {
            warn!(
                camera = %self.id,
                in_flight = state.frames.len(),
                requested = buffer_count,
                "More frames in use than the new capacity allows; honoring them to completion"
            );
        }

        Ok(())
    }

    /// First streaming client starts the hardware stream; later callers are
    /// a no-op returning success. A second hardware start is never issued
    /// while one is active.
    pub fn client_stream_starting(self: &Arc<Self>) -> EvsResult<()> {
        let mut state = lock_unpoisoned(&self.state);
        match state.stream_state {
            StreamState::Stopped => {
                state.stream_state = StreamState::Running;
                let sink: Arc<dyn CameraSink> = self.clone();
                if let Err(e) = self.hw.start_video_stream(sink) {
                    state.stream_state = StreamState::Stopped;
                    error!(camera = %self.id, "Hardware rejected the stream start: {e}");
                    return Err(e);
                }
                info!(camera = %self.id, "Hardware video stream started");
                Ok(())
            }
            _ => {
                debug!(camera = %self.id, "Stream already active; nothing to start");
                Ok(())
            }
        }
    }

    /// Called whenever a client stops streaming. The hardware stream is
    /// stopped only when no owned client is streaming anymore; this is the
    /// only path that stops the underlying device.
    pub fn client_stream_ending(&self) {
        let should_stop = {
            let mut state = lock_unpoisoned(&self.state);
            let still_running = state
                .clients
                .iter()
                .filter_map(Weak::upgrade)
                .any(|c| c.is_streaming());
            if !still_running && state.stream_state == StreamState::Running {
                state.stream_state = StreamState::Stopping;
                true
            } else {
                false
            }
        };

        // The stop call may deliver the terminal StreamStopped event
        // synchronously, so it must run without our lock held.
        if should_stop {
            info!(camera = %self.id, "Last client stopped; stopping the hardware stream");
            self.hw.stop_video_stream();
        }
    }

    /// Releases one client's reference on a buffer. When the last reference
    /// drops, the buffer goes back to the hardware exactly once. Unknown or
    /// already-released ids are a logged no-op.
    pub fn done_with_frame(&self, buffer_id: BufferId) {
        let mut state = lock_unpoisoned(&self.state);
        match state
            .frames
            .iter_mut()
            .find(|r| r.frame_id == buffer_id && r.ref_count > 0)
        {
            None => {
                error!(
                    camera = %self.id,
                    buffer_id,
                    "We got a frame back with an id we don't recognize!"
                );
            }
            Some(record) => {
                record.ref_count -= 1;
                if record.ref_count == 0 {
                    // All our clients are done with this buffer; return it
                    // to the device layer.
                    self.hw.done_with_frame(buffer_id);
                    metrics::counter!("argus_buffers_released").increment(1);
                }
            }
        }
    }

    /// Forwards an event to every live client.
    fn forward_event(&self, event: EvsEvent) {
        let state = lock_unpoisoned(&self.state);
        for client in state.clients.iter().filter_map(Weak::upgrade) {
            if !client.notify(event) {
                debug!(camera = %self.id, ?event, "Failed to forward an event");
            }
        }
    }

    /// Grants the primary role if it is free or already held by the caller.
    pub fn set_primary_client(&self, client: &Arc<VirtualCamera>) -> EvsResult<()> {
        let mut primary = lock_unpoisoned(&self.primary);
        match primary.upgrade() {
            None => {
                debug!(camera = %self.id, "A client becomes the primary");
                *primary = Arc::downgrade(client);
                Ok(())
            }
            Some(current) if Arc::ptr_eq(&current, client) => Ok(()),
            Some(_) => {
                debug!(camera = %self.id, "This camera already has a primary client");
                Err(EvsError::OwnershipLost)
            }
        }
    }

    /// Displaces any current primary. The displaced client is notified that
    /// it lost the role.
    pub fn force_primary_client(&self, client: &Arc<VirtualCamera>) {
        let displaced = {
            let mut primary = lock_unpoisoned(&self.primary);
            let prev = primary.upgrade();
            if prev.as_ref().is_some_and(|p| Arc::ptr_eq(p, client)) {
                debug!(camera = %self.id, "Caller is already the primary client");
                return;
            }
            *primary = Arc::downgrade(client);
            prev
        };

        if let Some(prev) = displaced {
            info!(camera = %self.id, "High priority client steals the primary role");
            if !prev.notify(EvsEvent::new(EvsEventKind::PrimaryClientReleased)) {
                error!(camera = %self.id, "Failed to deliver a role-lost notification");
            }
        }
    }

    /// Releases the primary role; only the current primary may do so. All
    /// clients are told the role is available again.
    pub fn unset_primary_client(&self, client: &Arc<VirtualCamera>) -> EvsResult<()> {
        {
            let mut primary = lock_unpoisoned(&self.primary);
            if !primary.upgrade().is_some_and(|p| Arc::ptr_eq(&p, client)) {
                return Err(EvsError::InvalidArg);
            }
            debug!(camera = %self.id, "Unset the primary client");
            *primary = Weak::new();
        }

        self.forward_event(EvsEvent::new(EvsEventKind::PrimaryClientReleased));
        Ok(())
    }

    /// Writes a camera parameter on behalf of `client`. Only the current
    /// primary may write; everyone may read. A successful write is announced
    /// to every client.
    pub fn set_parameter(
        &self,
        client: &Arc<VirtualCamera>,
        id: CameraParam,
        value: i32,
    ) -> EvsResult<i32> {
        let is_primary = lock_unpoisoned(&self.primary)
            .upgrade()
            .is_some_and(|p| Arc::ptr_eq(&p, client));
        if !is_primary {
            debug!(camera = %self.id, ?id, "Parameter change from a non-primary client declined");
            return Err(EvsError::OwnershipLost);
        }

        let effective = self.hw.set_parameter(id, value)?;
        self.forward_event(EvsEvent::parameter_changed(id, effective));
        Ok(effective)
    }

    /// Reads a camera parameter. Unrestricted.
    pub fn get_parameter(&self, id: CameraParam) -> EvsResult<i32> {
        self.hw.get_parameter(id)
    }

    pub fn parameter_list(&self) -> Vec<CameraParam> {
        self.hw.parameter_list()
    }

    pub fn set_extended_info(&self, opaque_id: u32, value: Vec<u8>) -> EvsResult<()> {
        self.hw.set_extended_info(opaque_id, value)
    }

    pub fn get_extended_info(&self, opaque_id: u32) -> EvsResult<Vec<u8>> {
        self.hw.get_extended_info(opaque_id)
    }

    pub fn import_external_buffers(
        &self,
        buffers: Vec<crate::hal::BufferDesc>,
    ) -> EvsResult<u32> {
        self.hw.import_external_buffers(buffers)
    }
}

/// Entry points invoked from the hardware's delivery thread.
impl CameraSink for HalCamera {
    /// Fans one hardware frame out to every client that accepts it. The
    /// ledger entry's count is the number of acceptors; a frame nobody wants
    /// goes straight back to the device rather than leaking.
    fn deliver_frame(&self, frame: Frame) {
        let mut state = lock_unpoisoned(&self.state);

        let mut deliveries = 0u32;
        for client in state.clients.iter().filter_map(Weak::upgrade) {
            if client.deliver_frame(frame.clone()) {
                deliveries += 1;
            }
        }

        if deliveries == 0 {
            // No client could take it; return the buffer right away.
            debug!(camera = %self.id, buffer_id = frame.buffer_id, "Trivially rejecting frame with no acceptance");
            metrics::counter!("argus_frames_rejected").increment(1);
            self.hw.done_with_frame(frame.buffer_id);
            return;
        }

        metrics::counter!("argus_frames_delivered").increment(1);
        match state.frames.iter_mut().find(|r| r.ref_count == 0) {
            Some(slot) => {
                slot.frame_id = frame.buffer_id;
                slot.ref_count = deliveries;
            }
            None => state.frames.push(FrameRecord {
                frame_id: frame.buffer_id,
                ref_count: deliveries,
            }),
        }
    }

    /// Stream lifecycle and notification events. A stream-stopped event
    /// finalizes our own state machine and is forwarded to every client,
    /// whatever their individual stream state, so each can wind down.
    fn notify(&self, event: EvsEvent) {
        let clients = {
            let mut state = lock_unpoisoned(&self.state);
            if event.kind == EvsEventKind::StreamStopped {
                if state.stream_state != StreamState::Stopping {
                    warn!(camera = %self.id, "Hardware stream stopped unexpectedly");
                }
                state.stream_state = StreamState::Stopped;
            }
            state
                .clients
                .iter()
                .filter_map(Weak::upgrade)
                .collect::<Vec<_>>()
        };

        for client in clients {
            if !client.notify(event) {
                debug!(camera = %self.id, ?event, "Failed to forward an event");
            }
        }
    }
}

impl Drop for HalCamera {
    fn drop(&mut self) {
        info!(camera = %self.id, "Releasing the hardware camera");
        self.hal.close_camera(self.hw.clone());
    }
}
