//! A running inspection session.
//!
//! Wiring: the capture worker sends `CaptureEvent`s to a router task, which owns the
//! `Aggregator`, feeds frames into the `DispatchQueue`, and turns capture events and inference
//! results into `SessionEvent`s for the presentation layer. Finished inspections go to the
//! `Recorder` on a separate task so slow persistence never holds up results.

use {
    crate::{
        Aggregator, BackendRegistry, Detector, DispatchQueue, InferenceResult, InspectionRecord,
        JsonOverrideStore, ModelSource, NullRecorder, OverrideStore, Recorder, SessionConfig,
        SessionError, SessionState, create_registry,
    },
    camera::{
        AppliedParameters, CameraError, CameraId, CaptureEvent, CaptureWorker, DeviceProvider,
        DirectorySink, ErrorKind, FrameRef, FrameSink, MemorySink, OverrideMap, ParameterOverrides,
        WorkerState, create_run_dir,
    },
    std::{sync::Arc, time::Duration},
    tokio::{
        sync::{mpsc, watch},
        task::{JoinHandle, spawn_blocking},
    },
};

/// What the presentation layer sees.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Configured {
        camera: CameraId,
        slot: Option<usize>,
        applied: AppliedParameters,
    },
    DeviceUnavailable {
        camera: CameraId,
        slot: Option<usize>,
        reason: CameraError,
    },
    FrameCaptured {
        camera: CameraId,
        slot: Option<usize>,
        sequence: u64,
    },
    FrameSkipped {
        camera: CameraId,
        sequence: u64,
        kind: Option<ErrorKind>,
    },
    Result {
        slot: usize,
        camera: CameraId,
        sequence: u64,
        overlay: FrameRef,
        is_defect: bool,
        score_text: String,
        /// `InferenceFailure` when the result failed open.
        kind: Option<ErrorKind>,
    },
    /// A problem the session absorbed but the operator should see.
    Alert {
        kind: ErrorKind,
        camera: Option<CameraId>,
        message: String,
    },
    Cycle(SessionState),
    /// The capture worker is done. Inference on queued frames may still be running.
    CaptureFinished {
        stopped: bool,
    },
}

pub struct SessionBuilder {
    config: SessionConfig,
    provider: Arc<dyn DeviceProvider>,
    detector: Option<Arc<dyn Detector>>,
    registry: Option<BackendRegistry>,
    recorder: Arc<dyn Recorder>,
    store: Option<Arc<dyn OverrideStore>>,
    sink: Option<Arc<dyn FrameSink>>,
}

impl SessionBuilder {
    /// Use this detector instead of loading the configured backend.
    pub fn with_detector(mut self, detector: Arc<dyn Detector>) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Look the configured backend up here instead of in the built-in registry.
    pub fn with_registry(mut self, registry: BackendRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn Recorder>) -> Self {
        self.recorder = recorder;
        self
    }

    /// Use this store instead of the file named in the config.
    pub fn with_override_store(mut self, store: Arc<dyn OverrideStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use this sink instead of the one implied by the config's frame directory.
    pub fn with_sink(mut self, sink: Arc<dyn FrameSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Configure the cameras and start capturing.
    ///
    /// Fails with `NoDevices` when no camera could be opened. Every other problem after this
    /// point is absorbed and reported as an event.
    pub async fn start(self) -> Result<(Session, mpsc::UnboundedReceiver<SessionEvent>), SessionError> {
        let config = self.config;
        config.validate()?;

        let store = match self.store {
            Some(store) => Some(store),
            None => config
                .override_store()
                .map(|path| Arc::new(JsonOverrideStore::new(path)) as Arc<dyn OverrideStore>),
        };
        let stored = match &store {
            Some(store) => store.load().unwrap_or_else(|error| {
                log::error!("failed to load stored overrides: {}", error);
                OverrideMap::new()
            }),
            None => OverrideMap::new(),
        };
        let overrides = config.merged_overrides(&stored);

        let detector = match self.detector {
            Some(detector) => detector,
            None => {
                let registry = self.registry.unwrap_or_else(create_registry);
                let weights = config.weights().map(|path| ModelSource::File(path.to_path_buf()));
                registry.load(config.backend(), weights)?
            }
        };

        // sequence numbers restart per session, so every session writes into fresh run dirs
        let sink: Arc<dyn FrameSink> = match (self.sink, config.frame_dir()) {
            (Some(sink), _) => sink,
            (None, Some(dir)) => Arc::new(DirectorySink::for_run(dir)?),
            (None, None) => Arc::new(MemorySink),
        };
        let staging_dir = config.staging_dir().map(create_run_dir).transpose()?;
        let overlay_dir = config.overlay_dir().map(create_run_dir).transpose()?;
        let dispatch_config = config
            .dispatch_config()
            .with_staging_dir(staging_dir)
            .with_overlay_dir(overlay_dir);

        let mut aggregator = Aggregator::new();
        aggregator.build_slot_map(config.cameras());

        let (capture_tx, mut capture_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (record_tx, record_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(aggregator.snapshot());
        let (capture_done_tx, capture_done_rx) = watch::channel(false);

        let dispatch = DispatchQueue::new(detector, dispatch_config, result_tx)?;

        let mut worker = CaptureWorker::new(self.provider, sink);
        let cameras = match worker.start(config.capture_request(overrides), capture_tx).await {
            Ok(cameras) => cameras,
            Err(CameraError::DeviceUnavailable(reason)) => {
                let mut failures = Vec::new();
                while let Ok(event) = capture_rx.try_recv() {
                    if let CaptureEvent::DeviceUnavailable { camera, reason } = event {
                        failures.push((camera, reason));
                    }
                }
                if failures.is_empty() {
                    return Err(SessionError::Camera(CameraError::DeviceUnavailable(reason)));
                }
                return Err(SessionError::NoDevices(failures));
            }
            Err(error) => return Err(error.into()),
        };
        log::info!(
            "session started: {} of {} cameras, {}",
            cameras.len(),
            config.cameras().len(),
            config.mode()
        );

        let router = Router {
            aggregator,
            dispatch: Some(dispatch.clone()),
            events: event_tx,
            snapshots: snapshot_tx,
            records: record_tx,
            capture_done: capture_done_tx,
        };
        let router = tokio::spawn(router.run(capture_rx, result_rx));
        let persister = tokio::spawn(persist(self.recorder, record_rx));

        Ok((
            Session {
                worker,
                dispatch,
                cameras,
                store,
                stop_timeout: config.stop_timeout(),
                snapshots: snapshot_rx,
                capture_done: capture_done_rx,
                router,
                persister,
            },
            event_rx,
        ))
    }
}

pub struct Session {
    worker: CaptureWorker,
    dispatch: DispatchQueue,
    cameras: Vec<CameraId>,
    store: Option<Arc<dyn OverrideStore>>,
    stop_timeout: Duration,
    snapshots: watch::Receiver<SessionState>,
    capture_done: watch::Receiver<bool>,
    router: JoinHandle<()>,
    persister: JoinHandle<()>,
}

impl Session {
    pub fn builder(config: SessionConfig, provider: Arc<dyn DeviceProvider>) -> SessionBuilder {
        SessionBuilder {
            config,
            provider,
            detector: None,
            registry: None,
            recorder: Arc::new(NullRecorder),
            store: None,
            sink: None,
        }
    }

    /// The cameras that opened, in configured order.
    pub fn cameras(&self) -> &[CameraId] {
        &self.cameras
    }

    pub fn snapshot(&self) -> SessionState {
        self.snapshots.borrow().clone()
    }

    /// A receiver that sees every state change.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.snapshots.clone()
    }

    pub fn queue_depth(&self) -> usize {
        self.dispatch.depth()
    }

    pub fn worker_state(&self) -> WorkerState {
        self.worker.state()
    }

    /// Ask capture to stop after the current grab. Queued frames are still inferred.
    pub fn stop(&self) {
        self.worker.stop();
    }

    /// Change exposure/gain of `camera` while running and remember the change in the store.
    ///
    /// The worker picks the change up before the camera's next grab; this returns once the
    /// store write is done.
    pub async fn update_overrides(&self, camera: CameraId, overrides: ParameterOverrides) {
        self.worker.update_overrides(camera.clone(), overrides.clone());
        let Some(store) = &self.store else {
            return;
        };
        let store = Arc::clone(store);
        let saved = spawn_blocking(move || store.save(&camera, &overrides).map_err(|e| (camera, e))).await;
        match saved {
            Ok(Ok(())) => {}
            Ok(Err((camera, error))) => {
                log::error!("camera {}: failed to store overrides: {}", camera, error)
            }
            Err(error) => log::error!("override store task failed: {}", error),
        }
    }

    /// Wait until the capture worker has finished and all its frames are queued.
    pub async fn wait_capture_finished(&self) {
        let mut done = self.capture_done.clone();
        let _ = done.wait_for(|done| *done).await;
    }

    /// Stop capture and end the session.
    ///
    /// With `drain` every queued frame is inferred first; without, queued frames are
    /// discarded and only the running job completes. Returns the final state. When the
    /// worker does not stop within the configured timeout it is abandoned, queued frames
    /// are discarded and `StopTimeout` is returned.
    pub async fn shutdown(mut self, drain: bool) -> Result<SessionState, SessionError> {
        self.worker.stop();
        if let Err(error) = self.worker.join(self.stop_timeout).await {
            self.dispatch.discard_pending();
            self.router.abort();
            return Err(error.into());
        }

        self.wait_capture_finished().await;
        if !drain {
            self.dispatch.discard_pending();
        }
        self.dispatch.wait_idle().await;

        // the router exits once the last queue handle is gone and its results are counted
        let Session {
            dispatch,
            snapshots,
            router,
            persister,
            ..
        } = self;
        drop(dispatch);
        if let Err(error) = router.await {
            log::error!("session router failed: {}", error);
        }
        if let Err(error) = persister.await {
            log::error!("session recorder failed: {}", error);
        }

        let state = snapshots.borrow().clone();
        log::info!(
            "session finished: {} good, {} bad, {} cycles",
            state.good_count,
            state.bad_count,
            state.cycle_count
        );
        Ok(state)
    }
}

struct Router {
    aggregator: Aggregator,
    dispatch: Option<DispatchQueue>,
    events: mpsc::UnboundedSender<SessionEvent>,
    snapshots: watch::Sender<SessionState>,
    records: mpsc::UnboundedSender<(Arc<InferenceResult>, SessionState)>,
    capture_done: watch::Sender<bool>,
}

impl Router {
    async fn run(
        mut self,
        capture: mpsc::UnboundedReceiver<CaptureEvent>,
        mut results: mpsc::UnboundedReceiver<InferenceResult>,
    ) {
        let mut capture = Some(capture);
        loop {
            tokio::select! {
                event = next_capture(&mut capture) => match event {
                    Some(event) => self.on_capture(event),
                    None => {
                        capture = None;
                        self.dispatch = None;
                        self.capture_done.send_replace(true);
                    }
                },
                result = results.recv() => match result {
                    Some(result) => self.on_result(result),
                    None => break,
                },
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.aggregator.snapshot());
    }

    fn on_capture(&mut self, event: CaptureEvent) {
        match event {
            CaptureEvent::Configured { camera, applied } => {
                let slot = self.aggregator.slot(&camera);
                self.emit(SessionEvent::Configured {
                    camera,
                    slot,
                    applied,
                });
            }
            CaptureEvent::DeviceUnavailable { camera, reason } => {
                let slot = self.aggregator.slot(&camera);
                self.emit(SessionEvent::DeviceUnavailable {
                    camera,
                    slot,
                    reason,
                });
            }
            CaptureEvent::Frame(record) => {
                self.aggregator.on_frame_captured(&record);
                self.publish();
                let (camera, sequence) = (record.camera.clone(), record.sequence);
                let backlog = self.dispatch.as_ref().and_then(|dispatch| dispatch.enqueue(record));
                if let Some(depth) = backlog {
                    self.emit(SessionEvent::Alert {
                        kind: ErrorKind::QueueBacklog,
                        camera: None,
                        message: format!("{} frames waiting for inference", depth),
                    });
                }
                let slot = self.aggregator.slot(&camera);
                self.emit(SessionEvent::FrameCaptured {
                    camera,
                    slot,
                    sequence,
                });
            }
            CaptureEvent::Skipped {
                camera,
                sequence,
                error,
            } => self.emit(SessionEvent::FrameSkipped {
                camera,
                sequence,
                kind: error.kind(),
            }),
            CaptureEvent::CycleComplete { .. } => {
                self.aggregator.on_cycle_complete();
                self.publish();
                self.emit(SessionEvent::Cycle(self.aggregator.snapshot()));
            }
            CaptureEvent::Finished { stopped } => {
                self.emit(SessionEvent::CaptureFinished { stopped });
            }
        }
    }

    fn on_result(&mut self, result: InferenceResult) {
        let result = Arc::new(result);
        self.aggregator.on_inference_result(Arc::clone(&result));
        let state = self.aggregator.snapshot();
        self.snapshots.send_replace(state.clone());

        match state.slot(&result.camera) {
            Some(slot) => self.emit(SessionEvent::Result {
                slot,
                camera: result.camera.clone(),
                sequence: result.sequence,
                overlay: result.overlay.clone(),
                is_defect: result.is_defect,
                score_text: result.score_text.clone(),
                kind: result.is_fail_open().then_some(ErrorKind::InferenceFailure),
            }),
            None => log::warn!("camera {}: result for a camera without a slot", result.camera),
        }
        let _ = self.records.send((result, state));
    }
}

async fn next_capture(capture: &mut Option<mpsc::UnboundedReceiver<CaptureEvent>>) -> Option<CaptureEvent> {
    match capture {
        Some(capture) => capture.recv().await,
        None => std::future::pending().await,
    }
}

async fn persist(
    recorder: Arc<dyn Recorder>,
    mut records: mpsc::UnboundedReceiver<(Arc<InferenceResult>, SessionState)>,
) {
    while let Some((result, state)) = records.recv().await {
        let recorder = Arc::clone(&recorder);
        let outcome = spawn_blocking(move || {
            let record = InspectionRecord::new(&result, &state)?;
            recorder.record(&record)
        })
        .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(error)) => log::error!("failed to persist inspection: {}", error),
            Err(error) => log::error!("persist task failed: {}", error),
        }
    }
}
