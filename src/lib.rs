pub mod error;
pub mod frame;
pub mod hal;
pub mod mux;
pub mod utils;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::hal::StreamConfig;

pub use crate::error::{EvsError, EvsResult};
pub use crate::frame::{BufferId, Frame, FrameMetadata, PixelFormat};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<ServiceConfig>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(ServiceConfig::default()));

/// Which hardware backend the service runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HalBackend {
    /// In-memory fake devices with a synthetic frame source.
    Mock,
    /// Real V4L2 capture devices (requires the `v4l2-hal` feature).
    V4l2,
}

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub backend: HalBackend,
    pub stream: StreamConfig,
    /// Buffer quota requested by the demo client.
    pub max_frames_in_flight: u32,
    /// Capacity of the frame channel between the sink and the consumer.
    pub channel_capacity: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            backend: HalBackend::Mock,
            stream: StreamConfig::default(),
            max_frames_in_flight: 4,
            channel_capacity: 8,
        }
    }
}

impl ServiceConfig {
    /// Loads configuration from a TOML file, falling back to defaults for
    /// anything unset.
    pub fn load(path: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?
            .try_deserialize()
    }
}
