//! End-to-end scenarios over the mock hardware backend: several clients on
//! one camera, quota aggregation, reference-counted frame return, and
//! teardown ordering.

use std::sync::{Arc, Mutex};
use std::thread;

use argus::frame::{BufferId, Frame};
use argus::hal::mock::MockHal;
use argus::hal::{CameraDescriptor, CameraSink, EvsEvent, EvsEventKind, StreamConfig};
use argus::mux::Enumerator;
use argus::EvsError;

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
        self.frames.lock().unwrap().iter().map(|f| f.buffer_id).collect()
    }

    fn has_event(&self, kind: EvsEventKind) -> bool {
        self.events.lock().unwrap().iter().any(|e| e.kind == kind)
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

#[test]
fn quota_follows_clients_across_open_and_close() {
    let hal = MockHal::with_physical(&["cam0"]);
    let enumerator = Enumerator::new(hal.clone());
    let config = StreamConfig::default();

    // A with the default quota of 1, B raised to 2: aggregate 3.
    let a = enumerator.open_camera("cam0", &config).unwrap();
    let b = enumerator.open_camera("cam0", &config).unwrap();
    b.set_max_frames_in_flight(2).unwrap();

    let mock = hal.camera("cam0").unwrap();
    assert_eq!(mock.last_quota(), Some(3));

    enumerator.close_camera(&a);
    assert_eq!(mock.last_quota(), Some(2));
    assert_eq!(hal.closed_count("cam0"), 0);

    let returned = mock.returned_buffers();
    enumerator.close_camera(&b);
    assert_eq!(hal.closed_count("cam0"), 1);
    // Closing must not invent buffer releases.
    assert_eq!(mock.returned_buffers(), returned);
}

#[test]
fn buffer_returns_to_hardware_when_the_last_holder_releases() {
    let hal = MockHal::with_physical(&["cam0"]);
    let enumerator = Enumerator::new(hal.clone());
    let config = StreamConfig::default();

    let a = enumerator.open_camera("cam0", &config).unwrap();
    let b = enumerator.open_camera("cam0", &config).unwrap();
    a.start_video_stream(TestSink::new()).unwrap();
    b.start_video_stream(TestSink::new()).unwrap();

    let mock = hal.camera("cam0").unwrap();
    let id = mock.inject_frame().unwrap();

    a.done_with_frame(id).unwrap();
    assert!(mock.returned_buffers().is_empty());

    b.done_with_frame(id).unwrap();
    assert_eq!(mock.returned_buffers(), vec![id]);

    // Neither client can double-release.
    assert_eq!(a.done_with_frame(id), Err(EvsError::InvalidArg));
    assert_eq!(mock.returned_buffers(), vec![id]);

    enumerator.close_camera(&a);
    enumerator.close_camera(&b);
}

#[test]
fn slow_client_misses_frames_while_others_keep_streaming() {
    let hal = MockHal::with_physical(&["cam0"]);
    let enumerator = Enumerator::new(hal.clone());
    let config = StreamConfig::default();

    let slow = enumerator.open_camera("cam0", &config).unwrap();
    let fast = enumerator.open_camera("cam0", &config).unwrap();
    fast.set_max_frames_in_flight(2).unwrap();

    let slow_sink = TestSink::new();
    let fast_sink = TestSink::new();
    slow.start_video_stream(slow_sink.clone()).unwrap();
    fast.start_video_stream(fast_sink.clone()).unwrap();

    let mock = hal.camera("cam0").unwrap();
    let first = mock.inject_frame().unwrap();
    let second = mock.inject_frame().unwrap();

    // The slow client (quota 1, nothing returned) only saw the first frame;
    // the fast one saw both.
    assert_eq!(slow_sink.frame_ids(), vec![first]);
    assert_eq!(fast_sink.frame_ids(), vec![first, second]);

    // The second frame is only referenced by the fast client, so its
    // release alone sends the buffer back.
    fast.done_with_frame(second).unwrap();
    assert_eq!(mock.returned_buffers(), vec![second]);

    enumerator.close_camera(&slow);
    enumerator.close_camera(&fast);
}

#[test]
fn closing_a_streaming_client_releases_its_frames() {
    let hal = MockHal::with_physical(&["cam0"]);
    let enumerator = Enumerator::new(hal.clone());
    let config = StreamConfig::default();

    let a = enumerator.open_camera("cam0", &config).unwrap();
    let b = enumerator.open_camera("cam0", &config).unwrap();
    let a_sink = TestSink::new();
    a.start_video_stream(a_sink.clone()).unwrap();
    b.start_video_stream(TestSink::new()).unwrap();

    let mock = hal.camera("cam0").unwrap();
    let id = mock.inject_frame().unwrap();
    b.done_with_frame(id).unwrap();

    // A still holds the frame; closing it must release the reference so the
    // buffer makes it back to the device.
    enumerator.close_camera(&a);
    assert!(a_sink.has_event(EvsEventKind::StreamStopped));
    assert_eq!(mock.returned_buffers(), vec![id]);

    // B's stream survived its neighbor's departure.
    assert!(b.is_streaming());
    assert!(mock.is_streaming());

    enumerator.close_camera(&b);
    assert!(!mock.is_streaming());
}

#[test]
fn primary_role_is_exclusive_across_clients() {
    let hal = MockHal::with_physical(&["cam0"]);
    let enumerator = Enumerator::new(hal.clone());
    let config = StreamConfig::default();

    let a = enumerator.open_camera("cam0", &config).unwrap();
    let b = enumerator.open_camera("cam0", &config).unwrap();

    a.set_primary_client().unwrap();
    assert_eq!(b.set_primary_client(), Err(EvsError::OwnershipLost));
    assert_eq!(
        b.set_parameter(argus::hal::CameraParam::Brightness, 10),
        Err(EvsError::OwnershipLost)
    );

    // Reads stay unrestricted.
    assert!(b.get_parameter(argus::hal::CameraParam::Brightness).is_ok());

    // Display ownership lets B take the role by force.
    let display = enumerator.open_display(0).unwrap();
    b.force_primary_client(&display).unwrap();
    assert!(b.set_parameter(argus::hal::CameraParam::Brightness, 10).is_ok());
    assert_eq!(
        a.set_parameter(argus::hal::CameraParam::Brightness, 11),
        Err(EvsError::OwnershipLost)
    );

    // A superseded display handle no longer proves anything.
    let fresh = enumerator.open_display(1).unwrap();
    assert_eq!(a.force_primary_client(&display), Err(EvsError::OwnershipLost));
    a.force_primary_client(&fresh).unwrap();

    enumerator.close_display(&fresh);
    enumerator.close_camera(&a);
    enumerator.close_camera(&b);
}

#[test]
fn concurrent_fanout_returns_every_buffer() {
    let hal = MockHal::with_physical(&["cam0"]);
    let enumerator = Enumerator::new(hal.clone());
    let config = StreamConfig::default();

    const FRAMES: u32 = 200;
    const QUOTA: u32 = 4;

    let a = enumerator.open_camera("cam0", &config).unwrap();
    let b = enumerator.open_camera("cam0", &config).unwrap();
    a.set_max_frames_in_flight(QUOTA).unwrap();
    b.set_max_frames_in_flight(QUOTA).unwrap();

    // Each client returns frames from its own worker thread.
    let (a_tx, a_rx) = flume::unbounded::<Frame>();
    let (b_tx, b_rx) = flume::unbounded::<Frame>();

    struct ForwardSink(flume::Sender<Frame>);
    impl CameraSink for ForwardSink {
        fn deliver_frame(&self, frame: Frame) {
            let _ = self.0.send(frame);
        }
        fn notify(&self, _event: EvsEvent) {}
    }

    a.start_video_stream(Arc::new(ForwardSink(a_tx))).unwrap();
    b.start_video_stream(Arc::new(ForwardSink(b_tx))).unwrap();

    let a_worker = {
        let a = a.clone();
        thread::spawn(move || {
            let mut seen = Vec::new();
            while let Ok(frame) = a_rx.recv() {
                seen.push(frame.meta.sequence);
                a.done_with_frame(frame.buffer_id).unwrap();
            }
            seen
        })
    };
    let b_worker = {
        let b = b.clone();
        thread::spawn(move || {
            let mut seen = Vec::new();
            while let Ok(frame) = b_rx.recv() {
                seen.push(frame.meta.sequence);
                b.done_with_frame(frame.buffer_id).unwrap();
            }
            seen
        })
    };

    let mock = hal.camera("cam0").unwrap();
    let mut injected = 0u32;
    for _ in 0..FRAMES {
        if mock.inject_frame().is_some() {
            injected += 1;
        }
    }
    assert_eq!(injected, FRAMES);

    // Dropping the senders ends the workers once their queues drain.
    a.stop_video_stream().unwrap();
    b.stop_video_stream().unwrap();
    let a_seen = a_worker.join().unwrap();
    let b_seen = b_worker.join().unwrap();

    // Per-client ordering follows hardware arrival order.
    assert!(a_seen.windows(2).all(|w| w[0] < w[1]));
    assert!(b_seen.windows(2).all(|w| w[0] < w[1]));

    // Every accepted frame was eventually released back to the device,
    // each exactly once.
    let mut returned = mock.returned_buffers();
    let total = returned.len();
    returned.sort_unstable();
    returned.dedup();
    assert_eq!(returned.len(), total);
    assert_eq!(total as u32, FRAMES);

    enumerator.close_camera(&a);
    enumerator.close_camera(&b);
}

#[test]
fn rejected_quota_change_restores_the_previous_aggregate() {
    let hal = MockHal::new(vec![
        CameraDescriptor::physical("left"),
        CameraDescriptor::physical("right"),
        CameraDescriptor::logical("pair", vec!["left".into(), "right".into()]),
    ]);
    let enumerator = Enumerator::new(hal.clone());

    let client = enumerator
        .open_camera("pair", &StreamConfig::default())
        .unwrap();
    client.set_max_frames_in_flight(2).unwrap();

    let left = hal.camera("left").unwrap();
    let right = hal.camera("right").unwrap();
    assert_eq!(left.last_quota(), Some(2));
    assert_eq!(right.last_quota(), Some(2));

    // The first source accepts the raise, the second refuses it. The raise
    // must be undone on the first, back to the aggregate it carried before,
    // and the client's own quota must be untouched.
    right.set_fail_quota(true);
    assert!(client.set_max_frames_in_flight(3).is_err());
    assert_eq!(left.last_quota(), Some(2));
    assert_eq!(client.allowed_buffers(), 2);

    right.set_fail_quota(false);
    client.set_max_frames_in_flight(3).unwrap();
    assert_eq!(left.last_quota(), Some(3));
    assert_eq!(right.last_quota(), Some(3));

    enumerator.close_camera(&client);
}

#[test]
fn logical_camera_streams_from_all_sources() {
    let hal = MockHal::new(vec![
        CameraDescriptor::physical("left"),
        CameraDescriptor::physical("right"),
        CameraDescriptor::logical("pair", vec!["left".into(), "right".into()]),
    ]);
    let enumerator = Enumerator::new(hal.clone());

    let client = enumerator
        .open_camera("pair", &StreamConfig::default())
        .unwrap();
    client.set_max_frames_in_flight(2).unwrap();
    let sink = TestSink::new();
    client.start_video_stream(sink.clone()).unwrap();

    let left = hal.camera("left").unwrap();
    let right = hal.camera("right").unwrap();
    assert!(left.is_streaming());
    assert!(right.is_streaming());

    left.inject_frame().unwrap();
    right.inject_frame().unwrap();

    let sources: Vec<String> = sink
        .frames
        .lock()
        .unwrap()
        .iter()
        .map(|f| f.source_id.clone())
        .collect();
    assert_eq!(sources, vec!["left".to_owned(), "right".to_owned()]);

    enumerator.close_camera(&client);
    assert!(!left.is_streaming());
    assert!(!right.is_streaming());
    assert_eq!(hal.closed_count("left"), 1);
    assert_eq!(hal.closed_count("right"), 1);
}
