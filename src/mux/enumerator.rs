//! Registry and lifecycle authority.
//!
//! The `Enumerator` is the only component that creates or destroys a
//! `HalCamera`. It maps camera ids to their singleton wrapper, expands
//! logical camera ids into their physical constituents, and arbitrates the
//! single exclusively-owned display handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, error, info, warn};

use crate::error::{EvsError, EvsResult};
use crate::hal::{CameraDescriptor, CameraHal, DisplayState, HwDisplay, StreamConfig};
use crate::mux::hal_camera::HalCamera;
use crate::mux::virtual_camera::VirtualCamera;
use crate::utils::lock_unpoisoned;

/// Client-facing display handle. Exclusive: opening a new display marks the
/// previous wrapper stale, and operations through a stale handle fail.
pub struct HalDisplay {
    hw: Arc<dyn HwDisplay>,
    stale: AtomicBool,
}

impl HalDisplay {
    fn new(hw: Arc<dyn HwDisplay>) -> Arc<Self> {
        Arc::new(Self {
            hw,
            stale: AtomicBool::new(false),
        })
    }

    fn invalidate(&self) {
        self.stale.store(true, Ordering::Release);
    }

    pub fn is_valid(&self) -> bool {
        !self.stale.load(Ordering::Acquire)
    }

    pub fn display_id(&self) -> u8 {
        self.hw.id()
    }

    pub fn state(&self) -> DisplayState {
        if !self.is_valid() {
            return DisplayState::NotOpen;
        }
        self.hw.state()
    }
}

pub struct Enumerator {
    hal: Arc<dyn CameraHal>,
    /// id -> singleton wrapper; the entry holds the strong reference that
    /// keeps the wrapper (and thus the hardware handle) alive.
    cameras: Mutex<HashMap<String, Arc<HalCamera>>>,
    /// Descriptor cache refreshed by `get_camera_list`.
    descriptors: Mutex<HashMap<String, CameraDescriptor>>,
    /// Most recently opened display; weak so an abandoned handle dies on
    /// its own.
    active_display: Mutex<Weak<HalDisplay>>,
}

impl Enumerator {
    pub fn new(hal: Arc<dyn CameraHal>) -> Self {
        Self {
            hal,
            cameras: Mutex::new(HashMap::new()),
            descriptors: Mutex::new(HashMap::new()),
            active_display: Mutex::new(Weak::new()),
        }
    }

    /// Enumerates the available cameras, refreshing the descriptor cache.
    pub fn get_camera_list(&self) -> Vec<CameraDescriptor> {
        let list = self.hal.camera_list();
        let mut cache = lock_unpoisoned(&self.descriptors);
        cache.clear();
        for desc in &list {
            cache.insert(desc.id.clone(), desc.clone());
        }
        list
    }

    /// Cameras currently open, by id.
    pub fn active_camera_ids(&self) -> Vec<String> {
        lock_unpoisoned(&self.cameras).keys().cloned().collect()
    }

    /// Resolves a camera id to the physical ids backing it. A logical
    /// aggregate (capability flag in its descriptor) expands to its
    /// constituents; a plain physical id maps to itself.
    fn physical_camera_ids(&self, id: &str) -> Vec<String> {
        {
            let cache = lock_unpoisoned(&self.descriptors);
            if !cache.is_empty() {
                return match cache.get(id) {
                    None => Vec::new(),
                    Some(desc) if desc.is_logical() => desc.physical_ids.clone(),
                    Some(_) => vec![id.to_owned()],
                };
            }
        }
        // Cache not primed yet; enumerate first.
        self.get_camera_list();
        let cache = lock_unpoisoned(&self.descriptors);
        match cache.get(id) {
            None => Vec::new(),
            Some(desc) if desc.is_logical() => desc.physical_ids.clone(),
            Some(_) => vec![id.to_owned()],
        }
    }

    /// Opens a camera for one client. The underlying hardware camera is
    /// opened on first use and shared afterwards; a configuration mismatch
    /// against an already-open camera is logged and the existing
    /// configuration wins.
    pub fn open_camera(
        &self,
        id: &str,
        config: &StreamConfig,
    ) -> EvsResult<Arc<VirtualCamera>> {
        let physical = self.physical_camera_ids(id);
        if physical.is_empty() {
            error!(id, "Requested camera not found or not available");
            return Err(EvsError::CameraNotAvailable(id.to_owned()));
        }

        let mut cameras = lock_unpoisoned(&self.cameras);

        let mut sources: Vec<Arc<HalCamera>> = Vec::new();
        let mut opened_here: Vec<String> = Vec::new();
        for pid in &physical {
            if let Some(existing) = cameras.get(pid) {
                if existing.stream_config() != config {
                    warn!(
                        camera = %pid,
                        active = ?existing.stream_config(),
                        requested = ?config,
                        "Requested camera is already active in a different configuration; keeping the active one"
                    );
                }
                sources.push(existing.clone());
                continue;
            }

            match self.hal.open_camera(pid, config) {
                Ok(hw) => {
                    let camera = Arc::new(HalCamera::new(
                        pid.clone(),
                        hw,
                        self.hal.clone(),
                        config.clone(),
                    ));
                    cameras.insert(pid.clone(), camera.clone());
                    opened_here.push(pid.clone());
                    sources.push(camera);
                }
                Err(e) => {
                    error!(camera = %pid, "Failed to open hardware camera: {e}");
                    // Unwind anything we opened for this call; dropping the
                    // registry entry closes the hardware handle.
                    for oid in &opened_here {
                        cameras.remove(oid);
                    }
                    return Err(e);
                }
            }
        }

        let logical_desc = if physical.len() > 1 {
            lock_unpoisoned(&self.descriptors).get(id).cloned()
        } else {
            None
        };

        let client = VirtualCamera::new(sources.clone(), logical_desc);

        let mut owned: Vec<&Arc<HalCamera>> = Vec::new();
        for source in &sources {
            if let Err(e) = source.own_virtual_camera(&client) {
                error!(camera = %source.id(), "Camera failed to own the new client: {e}");
                for prior in owned {
                    prior.disown_virtual_camera(&client);
                }
                client.shutdown();
                for oid in &opened_here {
                    if cameras.get(oid).is_some_and(|c| c.client_count() == 0) {
                        cameras.remove(oid);
                    }
                }
                return Err(e);
            }
            owned.push(source);
        }

        debug!(id, sources = sources.len(), "Camera opened");
        Ok(client)
    }

    /// Closes one client handle. Every source camera disowns the client;
    /// a source left without clients is erased from the registry, which is
    /// the only point a hardware camera gets destroyed.
    pub fn close_camera(&self, client: &Arc<VirtualCamera>) {
        let sources = client.sources_snapshot();
        if sources.is_empty() {
            warn!("Ignoring closeCamera on an already shut-down handle");
            return;
        }

        {
            let mut cameras = lock_unpoisoned(&self.cameras);
            for source in &sources {
                source.disown_virtual_camera(client);
                if source.client_count() == 0 {
                    debug!(camera = %source.id(), "Last client closed; dropping the camera");
                    cameras.remove(source.id());
                }
            }
        }

        // Defensive: make sure the stream is down and every held frame is
        // released before the last strong reference goes away.
        client.shutdown();
    }

    /// Opens the display, superseding any previously opened handle. The old
    /// handle stays allocated but every further operation through it fails.
    pub fn open_display(&self, id: u8) -> EvsResult<Arc<HalDisplay>> {
        let hw = self.hal.open_display(id).inspect_err(|e| {
            error!(display = id, "Display unavailable: {e}");
        })?;

        let display = HalDisplay::new(hw);
        let mut active = lock_unpoisoned(&self.active_display);
        if let Some(previous) = active.upgrade() {
            info!(
                display = previous.display_id(),
                "A new display handle supersedes the current one"
            );
            previous.invalidate();
        }
        *active = Arc::downgrade(&display);
        Ok(display)
    }

    /// Closes the active display. Closing a stale or unknown handle is a
    /// logged no-op.
    pub fn close_display(&self, display: &Arc<HalDisplay>) {
        let mut active = lock_unpoisoned(&self.active_display);
        match active.upgrade() {
            Some(current) if Arc::ptr_eq(&current, display) => {
                current.invalidate();
                self.hal.close_display(current.hw.clone());
                *active = Weak::new();
            }
            _ => {
                warn!("Ignoring call to closeDisplay with an unrecognized display handle");
            }
        }
    }

    pub fn get_display_state(&self) -> DisplayState {
        match lock_unpoisoned(&self.active_display).upgrade() {
            Some(display) => display.state(),
            None => DisplayState::NotOpen,
        }
    }

    pub fn display_id_list(&self) -> Vec<u8> {
        self.hal.display_id_list()
    }
}

impl Drop for Enumerator {
    /// Teardown drains the registry; each remaining camera closes its
    /// hardware handle as its last reference drops.
    fn drop(&mut self) {
        let mut cameras = lock_unpoisoned(&self.cameras);
        if !cameras.is_empty() {
            warn!(
                remaining = cameras.len(),
                "Enumerator torn down with cameras still open"
            );
        }
        cameras.clear();
    }
}
