//! Error taxonomy shared by the multiplexing core and the HAL backends

use thiserror::Error;

/// Result alias used across the crate.
pub type EvsResult<T> = Result<T, EvsError>;

/// Failure modes surfaced to camera clients.
///
/// Ownership conflicts are kept distinct from generic failures so a client
/// that lost its primary role can tell the difference from a device error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvsError {
    /// The video stream was already started by this client.
    #[error("video stream is already running")]
    StreamAlreadyRunning,

    /// The requested buffer count was rejected or no buffer is available.
    #[error("buffer is not available")]
    BufferNotAvailable,

    /// The caller does not hold the primary-client role required for this
    /// operation, or an exclusively-owned handle has been superseded.
    #[error("caller does not own the camera's primary role")]
    OwnershipLost,

    /// A request argument did not refer to anything this layer knows about.
    #[error("invalid argument")]
    InvalidArg,

    /// The camera id does not resolve to an available device, or the client
    /// handle has already been shut down.
    #[error("camera {0} is not available")]
    CameraNotAvailable(String),

    /// The underlying backend does not implement this operation.
    #[error("operation is not supported by this device")]
    NotSupported,

    /// An error reported by the underlying hardware layer, passed through
    /// verbatim. No retry is attempted on behalf of the caller.
    #[error("hardware failure: {0}")]
    Hardware(String),
}
