use {
    base::Vec2,
    camera::{
        CameraDevice, CameraError, CameraId, CaptureEvent, CaptureMode, CaptureRequest, CaptureWorker,
        DeviceProvider, DirectorySink, Frame, FrameRef, MemorySink, NumericParam, OverrideMap,
        ParameterOverrides, PixelFormat, Setting, WorkerState,
        sim::{SimProvider, SimSpec},
    },
    std::{sync::Arc, time::Duration},
    tokio::sync::mpsc,
};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

fn ids(names: &[&str]) -> Vec<CameraId> {
    names.iter().map(|name| CameraId::from(*name)).collect()
}

// collect events up to and including Finished
async fn drain(receiver: &mut mpsc::UnboundedReceiver<CaptureEvent>) -> Vec<CaptureEvent> {
    let mut events = Vec::new();
    while let Some(event) = receiver.recv().await {
        let finished = matches!(event, CaptureEvent::Finished { .. });
        events.push(event);
        if finished {
            break;
        }
    }
    events
}

fn frames(events: &[CaptureEvent]) -> Vec<(String, u64)> {
    events
        .iter()
        .filter_map(|event| match event {
            CaptureEvent::Frame(record) => Some((record.camera.to_string(), record.sequence)),
            _ => None,
        })
        .collect()
}

fn cycles(events: &[CaptureEvent]) -> Vec<u64> {
    events
        .iter()
        .filter_map(|event| match event {
            CaptureEvent::CycleComplete { cycle } => Some(*cycle),
            _ => None,
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_finite_run_goes_camera_by_camera() {
    let mut worker = CaptureWorker::new(Arc::new(SimProvider::new()), Arc::new(MemorySink));
    let (sender, mut receiver) = mpsc::unbounded_channel();

    let request = CaptureRequest::new(ids(&["a", "b"]), CaptureMode::AreaScan).with_frames_per_camera(3);
    let opened = worker.start(request, sender).await.unwrap();
    assert_eq!(opened, ids(&["a", "b"]));

    let events = drain(&mut receiver).await;
    worker.join(STOP_TIMEOUT).await.unwrap();

    assert_eq!(
        frames(&events),
        vec![
            ("a".to_string(), 0),
            ("a".to_string(), 1),
            ("a".to_string(), 2),
            ("b".to_string(), 0),
            ("b".to_string(), 1),
            ("b".to_string(), 2),
        ]
    );
    assert_eq!(cycles(&events), vec![1]);
    assert!(matches!(events.last(), Some(CaptureEvent::Finished { stopped: false })));
    assert_eq!(worker.state(), WorkerState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_configured_event_per_camera_before_frames() {
    let mut worker = CaptureWorker::new(Arc::new(SimProvider::new()), Arc::new(MemorySink));
    let (sender, mut receiver) = mpsc::unbounded_channel();

    let request = CaptureRequest::new(ids(&["a", "b"]), CaptureMode::LineScan).with_frames_per_camera(1);
    worker.start(request, sender).await.unwrap();
    let events = drain(&mut receiver).await;

    assert!(matches!(&events[0], CaptureEvent::Configured { camera, .. } if camera.as_str() == "a"));
    assert!(matches!(&events[1], CaptureEvent::Configured { camera, .. } if camera.as_str() == "b"));
    assert_eq!(frames(&events).len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timeout_is_skipped_and_sequence_advances() {
    let spec = SimSpec {
        timeout_on: vec![1],
        ..Default::default()
    };
    let provider = SimProvider::new().with_camera("a", spec);
    let mut worker = CaptureWorker::new(Arc::new(provider), Arc::new(MemorySink));
    let (sender, mut receiver) = mpsc::unbounded_channel();

    let request = CaptureRequest::new(ids(&["a"]), CaptureMode::AreaScan).with_frames_per_camera(3);
    worker.start(request, sender).await.unwrap();
    let events = drain(&mut receiver).await;

    assert_eq!(frames(&events), vec![("a".to_string(), 0), ("a".to_string(), 2)]);
    let skipped: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            CaptureEvent::Skipped { sequence, error, .. } => Some((*sequence, error.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(skipped, vec![(1, CameraError::GrabTimeout)]);
    assert_eq!(cycles(&events), vec![1]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unavailable_camera_is_reported_and_others_continue() {
    let provider = SimProvider::new().with_unavailable("b");
    let mut worker = CaptureWorker::new(Arc::new(provider), Arc::new(MemorySink));
    let (sender, mut receiver) = mpsc::unbounded_channel();

    let request = CaptureRequest::new(ids(&["a", "b"]), CaptureMode::AreaScan).with_frames_per_camera(2);
    let opened = worker.start(request, sender).await.unwrap();
    assert_eq!(opened, ids(&["a"]));

    let events = drain(&mut receiver).await;
    assert!(events.iter().any(|event| matches!(
        event,
        CaptureEvent::DeviceUnavailable { camera, reason: CameraError::DeviceUnavailable(_) }
            if camera.as_str() == "b"
    )));
    assert_eq!(frames(&events), vec![("a".to_string(), 0), ("a".to_string(), 1)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_all_cameras_unavailable_fails_start() {
    let provider = SimProvider::new().with_unavailable("a").with_unavailable("b");
    let mut worker = CaptureWorker::new(Arc::new(provider), Arc::new(MemorySink));
    let (sender, _receiver) = mpsc::unbounded_channel();

    let request = CaptureRequest::new(ids(&["a", "b"]), CaptureMode::AreaScan);
    let result = worker.start(request, sender).await;

    assert!(matches!(result, Err(CameraError::DeviceUnavailable(_))));
    assert_eq!(worker.state(), WorkerState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_ends_continuous_run_without_partial_cycle() {
    let spec = SimSpec {
        grab_delay: Duration::from_millis(5),
        ..Default::default()
    };
    let provider = Arc::new(SimProvider::new().with_default_spec(spec));
    let mut worker = CaptureWorker::new(provider.clone(), Arc::new(MemorySink));
    let (sender, mut receiver) = mpsc::unbounded_channel();

    let request =
        CaptureRequest::new(ids(&["a", "b"]), CaptureMode::ContinuousAreaScan).with_frames_per_camera(0);
    worker.start(request, sender).await.unwrap();

    // let a few rounds go by
    let mut events = Vec::new();
    let mut seen_cycles = 0;
    while seen_cycles < 2 {
        let event = receiver.recv().await.unwrap();
        if matches!(event, CaptureEvent::CycleComplete { .. }) {
            seen_cycles += 1;
        }
        events.push(event);
    }
    worker.stop();
    let grabs_at_stop = provider.grabs();
    worker.stop();
    assert!(matches!(worker.state(), WorkerState::Stopping | WorkerState::Stopped));

    events.extend(drain(&mut receiver).await);
    worker.join(STOP_TIMEOUT).await.unwrap();

    assert!(matches!(events.last(), Some(CaptureEvent::Finished { stopped: true })));
    // the grab under way when stop returned may finish, nothing new starts after it
    let total_grabs = provider.grabs();
    assert!(total_grabs <= grabs_at_stop + 1, "{total_grabs} grabs, {grabs_at_stop} at stop");
    let attempts = events
        .iter()
        .filter(|event| matches!(event, CaptureEvent::Frame(_) | CaptureEvent::Skipped { .. }))
        .count() as u64;
    assert_eq!(attempts, total_grabs);
    // a round cut short does not count
    assert_eq!(cycles(&events).len() as u64, total_grabs / 2);
    assert_eq!(worker.state(), WorkerState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_before_start_is_harmless() {
    let mut worker = CaptureWorker::new(Arc::new(SimProvider::new()), Arc::new(MemorySink));
    worker.stop();
    assert_eq!(worker.state(), WorkerState::Stopped);
    worker.join(STOP_TIMEOUT).await.unwrap();

    let (sender, _receiver) = mpsc::unbounded_channel();
    let request = CaptureRequest::new(ids(&["a"]), CaptureMode::AreaScan);
    assert!(worker.start(request, sender).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_live_override_applied_before_next_grab() {
    let spec = SimSpec {
        grab_delay: Duration::from_millis(5),
        exposure_range: Some((20.0, 80000.0)),
        ..Default::default()
    };
    let provider = Arc::new(SimProvider::new().with_default_spec(spec));
    let mut worker = CaptureWorker::new(provider.clone(), Arc::new(MemorySink));
    let (sender, mut receiver) = mpsc::unbounded_channel();

    let request = CaptureRequest::new(ids(&["a"]), CaptureMode::ContinuousAreaScan).with_frames_per_camera(0);
    worker.start(request, sender).await.unwrap();

    worker.update_overrides(
        CameraId::from("a"),
        ParameterOverrides {
            exposure: Some(200000.0),
            ..Default::default()
        },
    );

    let applied = loop {
        match receiver.recv().await {
            Some(CaptureEvent::Configured { applied, .. }) if applied.exposure.is_some() => break applied,
            Some(_) => continue,
            None => panic!("worker ended before applying the update"),
        }
    };
    worker.stop();
    drain(&mut receiver).await;
    worker.join(STOP_TIMEOUT).await.unwrap();

    assert_eq!(applied.exposure, Some(80000.0));
    assert!(provider
        .writes_for(&CameraId::from("a"))
        .contains(&Setting::ExposureTime(80000.0)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_overrides_reach_device() {
    let provider = Arc::new(SimProvider::new());
    let mut worker = CaptureWorker::new(provider.clone(), Arc::new(MemorySink));
    let (sender, mut receiver) = mpsc::unbounded_channel();

    let mut overrides = OverrideMap::new();
    overrides.insert(
        CameraId::from("a"),
        ParameterOverrides {
            gain: Some(3.5),
            ..Default::default()
        },
    );
    let request = CaptureRequest::new(ids(&["a", "b"]), CaptureMode::AreaScan).with_overrides(overrides);
    worker.start(request, sender).await.unwrap();
    drain(&mut receiver).await;

    assert!(provider.writes_for(&CameraId::from("a")).contains(&Setting::Gain(3.5)));
    assert!(!provider
        .writes_for(&CameraId::from("b"))
        .iter()
        .any(|setting| matches!(setting, Setting::Gain(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_directory_sink_writes_png_files() {
    let dir = std::env::temp_dir().join(format!("camera_worker_sink_{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    let sink = DirectorySink::new(&dir).unwrap();

    let mut worker = CaptureWorker::new(Arc::new(SimProvider::new()), Arc::new(sink));
    let (sender, mut receiver) = mpsc::unbounded_channel();
    let request = CaptureRequest::new(ids(&["cam:0"]), CaptureMode::AreaScan).with_frames_per_camera(2);
    worker.start(request, sender).await.unwrap();
    let events = drain(&mut receiver).await;

    let paths: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            CaptureEvent::Frame(record) => Some(record.frame.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(
        paths,
        vec![
            FrameRef::File(dir.join("cam_3a0_000000.png")),
            FrameRef::File(dir.join("cam_3a0_000001.png")),
        ]
    );
    let frame = paths[1].load().unwrap();
    assert_eq!(frame.size.x, 64);

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_similar_ids_keep_their_own_frames() {
    let dir = std::env::temp_dir().join(format!("camera_similar_ids_{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    let sink = DirectorySink::new(&dir).unwrap();

    let provider = SimProvider::new().with_camera(
        "cam_0",
        SimSpec {
            sensor: Vec2::new(16, 8),
            ..Default::default()
        },
    );
    let mut worker = CaptureWorker::new(Arc::new(provider), Arc::new(sink));
    let (sender, mut receiver) = mpsc::unbounded_channel();
    let request = CaptureRequest::new(ids(&["cam:0", "cam_0"]), CaptureMode::AreaScan);
    worker.start(request, sender).await.unwrap();
    let events = drain(&mut receiver).await;

    let records: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            CaptureEvent::Frame(record) => Some(record.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(records.len(), 2);
    assert_ne!(records[0].frame, records[1].frame);
    assert_eq!(records[0].frame.load().unwrap().size, Vec2::new(64, 48));
    assert_eq!(records[1].frame.load().unwrap().size, Vec2::new(16, 8));

    let _ = std::fs::remove_dir_all(&dir);
}

// tearing the stream down takes a while, so the Stopping state is observable
struct SlowTeardown {
    id: CameraId,
    streaming: bool,
}

impl CameraDevice for SlowTeardown {
    fn id(&self) -> &CameraId {
        &self.id
    }

    fn start_stream(&mut self) -> Result<(), CameraError> {
        self.streaming = true;
        Ok(())
    }

    fn stop_stream(&mut self) -> Result<(), CameraError> {
        if !self.streaming {
            return Err(CameraError::Stream("already stopped".to_string()));
        }
        std::thread::sleep(Duration::from_millis(300));
        self.streaming = false;
        Ok(())
    }

    fn write(&mut self, _setting: &Setting) -> Result<(), CameraError> {
        Ok(())
    }

    fn range(&self, _param: NumericParam) -> Option<(f64, f64)> {
        None
    }

    fn grab(&mut self, _timeout: Duration) -> Result<Frame, CameraError> {
        Frame::new(Vec2::new(2, 2), PixelFormat::Mono8, vec![128; 4])
    }
}

struct SlowTeardownProvider;

impl DeviceProvider for SlowTeardownProvider {
    fn open(&self, id: &CameraId) -> Result<Box<dyn CameraDevice>, CameraError> {
        Ok(Box::new(SlowTeardown {
            id: id.clone(),
            streaming: false,
        }))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reaching_frame_target_passes_through_stopping() {
    let mut worker = CaptureWorker::new(Arc::new(SlowTeardownProvider), Arc::new(MemorySink));
    let (sender, mut receiver) = mpsc::unbounded_channel();
    let request = CaptureRequest::new(ids(&["a"]), CaptureMode::AreaScan).with_frames_per_camera(2);
    worker.start(request, sender).await.unwrap();

    loop {
        match receiver.recv().await {
            Some(CaptureEvent::CycleComplete { .. }) => break,
            Some(_) => continue,
            None => panic!("worker ended without completing its cycle"),
        }
    }
    let mut state = worker.state();
    while state == WorkerState::Running {
        tokio::time::sleep(Duration::from_millis(1)).await;
        state = worker.state();
    }
    assert_eq!(state, WorkerState::Stopping);

    let rest = drain(&mut receiver).await;
    worker.join(STOP_TIMEOUT).await.unwrap();
    assert!(matches!(rest.last(), Some(CaptureEvent::Finished { stopped: false })));
    assert_eq!(worker.state(), WorkerState::Stopped);
}
