use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a mutex, recovering the guard if another thread panicked while
/// holding it. The protected state is simple bookkeeping that stays
/// consistent between statements, so continuing is preferable to poisoning
/// every other client of the camera.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(feature = "v4l2-hal")]
pub use detect::{detect_devices, FoundDevice};

#[cfg(feature = "v4l2-hal")]
mod detect {
    use serde::{Deserialize, Serialize};
    use tracing::info;
    use v4l::capability::Flags;
    use v4l::video::Capture;
    use v4l::{Device, FourCC};

    use crate::frame::PixelFormat;

    // Detected capture device info
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct FoundDevice {
        pub path: String,
        pub format: PixelFormat,
    }

    impl FoundDevice {
        pub fn new(path: String, format: PixelFormat) -> Self {
            Self { path, format }
        }
    }

    /// Scan `/dev/video*` for usable capture devices, preferring MJPEG.
    pub fn detect_devices() -> Vec<FoundDevice> {
        use std::path::Path;

        info!("Scanning for capture devices...");

        let mut found = Vec::new();
        for i in 0..10 {
            let path = format!("/dev/video{}", i);
            if !Path::new(&path).exists() {
                continue;
            }

            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
                continue;
            }

            if let Ok(formats) = dev.enum_formats() {
                for fmt in formats {
                    if fmt.fourcc == FourCC::new(b"MJPG") {
                        info!("Found MJPEG device: {} - {}", path, caps.card);
                        found.push(FoundDevice::new(path.clone(), PixelFormat::Mjpeg));
                        break;
                    } else if fmt.fourcc == FourCC::new(b"YUYV") {
                        info!("Found YUYV device: {} - {}", path, caps.card);
                        found.push(FoundDevice::new(path.clone(), PixelFormat::Yuyv4));
                        break;
                    }
                }
            }
        }

        found
    }
}
