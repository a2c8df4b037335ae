//! Argus camera multiplexing service
//!
//! Demo wiring: one hardware backend, the enumerator in front of it, and a
//! single streaming client consuming frames over a flume channel until
//! ctrl-c.

use std::sync::Arc;
use std::time::Duration;

use argus::frame::Frame;
use argus::hal::mock::MockHal;
use argus::hal::{CameraHal, CameraSink, EvsEvent, StreamConfig};
use argus::mux::{Enumerator, VirtualCamera};
use argus::{HalBackend, ServiceConfig};
use color_eyre::eyre::eyre;
use color_eyre::Result;
use flume::bounded;
use tracing::{error, info, warn};

/// Sink that hands frames to the consumer task. `try_send` keeps the
/// delivery thread non-blocking; the channel is sized above the client's
/// buffer quota so a full channel means a consumer bug, not back-pressure.
struct ChannelSink {
    tx: flume::Sender<Frame>,
}

impl CameraSink for ChannelSink {
    fn deliver_frame(&self, frame: Frame) {
        if let Err(e) = self.tx.try_send(frame) {
            error!("Failed to queue frame: {}", e);
        }
    }

    fn notify(&self, event: EvsEvent) {
        info!(?event, "camera event");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter("argus=debug")
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Argus launching...");

    // Load configuration
    let config = match std::env::args().nth(1) {
        Some(path) => ServiceConfig::load(&path)?,
        None => ServiceConfig::default(),
    };
    argus::CONFIG.store(Arc::new(config.clone()));

    let (hal, mock_hal): (Arc<dyn CameraHal>, Option<Arc<MockHal>>) = match config.backend {
        HalBackend::Mock => {
            let mock = MockHal::with_physical(&["mock0"]);
            (mock.clone(), Some(mock))
        }
        #[cfg(feature = "v4l2-hal")]
        HalBackend::V4l2 => (argus::hal::v4l2::V4l2Hal::new()?, None),
        #[cfg(not(feature = "v4l2-hal"))]
        HalBackend::V4l2 => {
            return Err(eyre!("built without the v4l2-hal feature"));
        }
    };

    let enumerator = Arc::new(Enumerator::new(hal.clone()));
    let cameras = enumerator.get_camera_list();
    let camera_id = cameras
        .first()
        .map(|c| c.id.clone())
        .ok_or_else(|| eyre!("no camera available"))?;
    info!("Using camera: {}", camera_id);

    let stream_config: StreamConfig = config.stream.clone();
    let camera = enumerator.open_camera(&camera_id, &stream_config)?;
    camera.set_max_frames_in_flight(config.max_frames_in_flight)?;

    // Set up tx/rx
    let (tx, rx) = bounded::<Frame>(config.channel_capacity.max(config.max_frames_in_flight as usize));
    camera.start_video_stream(Arc::new(ChannelSink { tx }))?;

    // For the mock backend, synthesize frames at the configured rate
    let pump = match mock_hal.as_ref().and_then(|m| m.camera(&camera_id)) {
        Some(mock) => {
            let interval = Duration::from_secs(1) / config.stream.fps.max(1);
            Some(tokio::spawn(async move {
                loop {
                    mock.inject_frame();
                    tokio::time::sleep(interval).await;
                }
            }))
        }
        None => None,
    };

    // Consume frames until ctrl-c
    let consumer_camera: Arc<VirtualCamera> = camera.clone();
    let consumer = tokio::spawn(async move {
        let mut count: u64 = 0;
        while let Ok(frame) = rx.recv_async().await {
            count += 1;
            if count % 100 == 0 {
                info!(frames = count, "streaming");
            }
            if let Err(e) = consumer_camera.done_with_frame(frame.buffer_id) {
                warn!("Frame return failed: {}", e);
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Argus shutting down");

    if let Some(pump) = pump {
        pump.abort();
    }
    camera.stop_video_stream().map_err(|e| eyre!(e))?;
    enumerator.close_camera(&camera);
    drop(consumer);

    Ok(())
}
