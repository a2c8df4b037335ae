//! Camera multiplexing core: one hardware stream, N clients.

pub mod enumerator;
pub mod hal_camera;
pub mod virtual_camera;

pub use enumerator::{Enumerator, HalDisplay};
pub use hal_camera::{HalCamera, StreamState};
pub use virtual_camera::VirtualCamera;
