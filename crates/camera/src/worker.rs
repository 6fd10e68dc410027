//! Capture Worker.
//!
//! Opens and configures every requested camera, then grabs frames on a dedicated blocking
//! thread until the request is satisfied or `stop` is called. Devices are only ever touched
//! from that thread. Everything the worker does is reported on the event channel; a single
//! camera failing never ends the session, only all of them failing to open does.

use {
    crate::{
        AppliedParameters, CameraDevice, CameraError, CameraId, CaptureMode, DeviceProvider,
        FrameRecord, FrameSink, OverrideMap, ParameterOverrides, apply_live, configure,
    },
    std::{
        fmt,
        sync::{
            Arc, Mutex,
            atomic::{AtomicBool, Ordering},
        },
        time::{Duration, SystemTime},
    },
    tokio::{
        sync::{mpsc, oneshot},
        task::{JoinHandle, spawn_blocking},
    },
};

// default per-grab wait
const DEFAULT_GRAB_TIMEOUT_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Configuring,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Idle => write!(f, "idle"),
            WorkerState::Configuring => write!(f, "configuring"),
            WorkerState::Running => write!(f, "running"),
            WorkerState::Stopping => write!(f, "stopping"),
            WorkerState::Stopped => write!(f, "stopped"),
        }
    }
}

/// What to capture.
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub cameras: Vec<CameraId>,
    pub mode: CaptureMode,
    /// Frames per camera; zero or less runs until stopped.
    pub frames_per_camera: i64,
    pub overrides: OverrideMap,
    pub grab_timeout: Duration,
}

impl CaptureRequest {
    pub fn new(cameras: Vec<CameraId>, mode: CaptureMode) -> Self {
        Self {
            cameras,
            mode,
            frames_per_camera: 1,
            overrides: OverrideMap::new(),
            grab_timeout: Duration::from_millis(DEFAULT_GRAB_TIMEOUT_MS),
        }
    }

    pub fn with_frames_per_camera(mut self, frames: i64) -> Self {
        self.frames_per_camera = frames;
        self
    }

    pub fn with_overrides(mut self, overrides: OverrideMap) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_grab_timeout(mut self, timeout: Duration) -> Self {
        self.grab_timeout = timeout;
        self
    }

    pub fn is_continuous(&self) -> bool {
        self.frames_per_camera <= 0
    }
}

#[derive(Debug, Clone)]
pub enum CaptureEvent {
    /// A camera was configured at start, or received a live override.
    Configured {
        camera: CameraId,
        applied: AppliedParameters,
    },
    DeviceUnavailable {
        camera: CameraId,
        reason: CameraError,
    },
    Frame(FrameRecord),
    /// A grab or persist attempt that produced no frame. The sequence number is still used up.
    Skipped {
        camera: CameraId,
        sequence: u64,
        error: CameraError,
    },
    /// Every camera got its frames: once at the end of a finite run, after each full round
    /// in continuous mode.
    CycleComplete {
        cycle: u64,
    },
    /// Last event of a run. `stopped` is true when the run was cut short.
    Finished {
        stopped: bool,
    },
}

struct Shared {
    state: Mutex<WorkerState>,
    pending: Mutex<OverrideMap>,
}

impl Shared {
    fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    // moves to `to` unless the worker is already winding down
    fn advance(&self, to: WorkerState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !matches!(*state, WorkerState::Stopping | WorkerState::Stopped) {
            *state = to;
        }
    }

    fn take_pending(&self, camera: &CameraId) -> Option<ParameterOverrides> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(camera)
    }
}

pub struct CaptureWorker {
    provider: Arc<dyn DeviceProvider>,
    sink: Arc<dyn FrameSink>,
    cancel: Arc<AtomicBool>,
    shared: Arc<Shared>,
    join_handle: Option<JoinHandle<()>>,
}

impl CaptureWorker {
    pub fn new(provider: Arc<dyn DeviceProvider>, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            provider,
            sink,
            cancel: Arc::new(AtomicBool::new(false)),
            shared: Arc::new(Shared {
                state: Mutex::new(WorkerState::Idle),
                pending: Mutex::new(OverrideMap::new()),
            }),
            join_handle: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    /// Open and configure the cameras, then start capturing in the background.
    ///
    /// Returns once configuration is done, with the cameras that opened. Fails with
    /// `DeviceUnavailable` when none did. A worker runs once; start it again and it refuses.
    pub async fn start(
        &mut self,
        request: CaptureRequest,
        events: mpsc::UnboundedSender<CaptureEvent>,
    ) -> Result<Vec<CameraId>, CameraError> {
        {
            let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != WorkerState::Idle {
                return Err(CameraError::Stream(format!("capture worker is {}", *state)));
            }
            *state = WorkerState::Configuring;
        }

        let (init_tx, init_rx) = oneshot::channel::<Result<Vec<CameraId>, CameraError>>();

        let join_handle = spawn_blocking({
            let provider = Arc::clone(&self.provider);
            let sink = Arc::clone(&self.sink);
            let cancel = Arc::clone(&self.cancel);
            let shared = Arc::clone(&self.shared);
            move || {
                let devices = open_all(provider.as_ref(), &request, &events);
                if devices.is_empty() {
                    log::error!("capture worker: no camera could be opened");
                    shared.set_state(WorkerState::Stopped);
                    let _ = init_tx.send(Err(CameraError::DeviceUnavailable(
                        "no camera could be opened".to_string(),
                    )));
                    return;
                }

                let opened = devices.iter().map(|device| device.id().clone()).collect();
                shared.advance(WorkerState::Running);
                let _ = init_tx.send(Ok(opened));

                let mut capture = CaptureLoop {
                    sequences: vec![0; devices.len()],
                    devices,
                    sink,
                    events,
                    cancel,
                    shared,
                    grab_timeout: request.grab_timeout,
                };
                if request.is_continuous() {
                    capture.run_continuous();
                } else {
                    capture.run_finite(request.frames_per_camera as u64);
                }
                capture.finish();
            }
        });
        self.join_handle = Some(join_handle);

        init_rx
            .await
            .map_err(|_| CameraError::Stream("capture worker died during init".to_string()))?
    }

    /// Ask the loop to end after the current grab. Safe to call any number of times.
    pub fn stop(&self) {
        self.cancel.store(true, Ordering::Relaxed);
        let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            WorkerState::Idle => *state = WorkerState::Stopped,
            WorkerState::Configuring | WorkerState::Running => {
                log::info!("capture worker: stopping");
                *state = WorkerState::Stopping;
            }
            WorkerState::Stopping | WorkerState::Stopped => {}
        }
    }

    /// Wait for the capture thread to finish.
    ///
    /// Past `timeout` the thread is abandoned and `StopTimeout` returned; it still exits on
    /// its own once its current grab returns.
    pub async fn join(&mut self, timeout: Duration) -> Result<(), CameraError> {
        let Some(handle) = self.join_handle.take() else {
            return Ok(());
        };
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(CameraError::Stream(format!("capture worker panicked: {}", error))),
            Err(_) => {
                log::error!(
                    "capture worker: did not stop within {} ms, abandoning it",
                    timeout.as_millis()
                );
                Err(CameraError::StopTimeout(timeout))
            }
        }
    }

    /// Queue exposure/gain changes for `camera`. They are applied before its next grab.
    pub fn update_overrides(&self, camera: CameraId, overrides: ParameterOverrides) {
        let mut pending = self.shared.pending.lock().unwrap_or_else(|e| e.into_inner());
        let merged = match pending.get(&camera) {
            Some(queued) => queued.merged(&overrides),
            None => overrides,
        };
        pending.insert(camera, merged);
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}

fn open_all(
    provider: &dyn DeviceProvider,
    request: &CaptureRequest,
    events: &mpsc::UnboundedSender<CaptureEvent>,
) -> Vec<Box<dyn CameraDevice>> {
    let no_overrides = ParameterOverrides::default();
    let mut devices = Vec::with_capacity(request.cameras.len());
    for camera in &request.cameras {
        match provider.open(camera) {
            Ok(mut device) => {
                let overrides = request.overrides.get(camera).unwrap_or(&no_overrides);
                let applied = configure(device.as_mut(), request.mode, overrides);
                let _ = events.send(CaptureEvent::Configured {
                    camera: camera.clone(),
                    applied,
                });
                devices.push(device);
            }
            Err(error) => {
                log::error!("camera {}: {}", camera, error);
                let _ = events.send(CaptureEvent::DeviceUnavailable {
                    camera: camera.clone(),
                    reason: error,
                });
            }
        }
    }
    devices
}

struct CaptureLoop {
    devices: Vec<Box<dyn CameraDevice>>,
    sequences: Vec<u64>,
    sink: Arc<dyn FrameSink>,
    events: mpsc::UnboundedSender<CaptureEvent>,
    cancel: Arc<AtomicBool>,
    shared: Arc<Shared>,
    grab_timeout: Duration,
}

impl CaptureLoop {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    // a closed event channel means nobody is listening any more, which counts as a stop
    fn emit(&self, event: CaptureEvent) {
        if self.events.send(event).is_err() && !self.cancelled() {
            log::debug!("capture worker: event receiver dropped, stopping");
            self.cancel.store(true, Ordering::Relaxed);
        }
    }

    fn run_finite(&mut self, frames: u64) {
        'cameras: for index in 0..self.devices.len() {
            for _ in 0..frames {
                if self.cancelled() {
                    break 'cameras;
                }
                self.attempt(index);
            }
        }
        if !self.cancelled() {
            self.emit(CaptureEvent::CycleComplete { cycle: 1 });
        }
    }

    fn run_continuous(&mut self) {
        let mut cycle = 0;
        loop {
            for index in 0..self.devices.len() {
                if self.cancelled() {
                    return;
                }
                self.attempt(index);
            }
            cycle += 1;
            self.emit(CaptureEvent::CycleComplete { cycle });
        }
    }

    fn attempt(&mut self, index: usize) {
        self.apply_pending(index);

        let sequence = self.sequences[index];
        self.sequences[index] += 1;

        let device = &mut self.devices[index];
        let camera = device.id().clone();
        let result = device.grab(self.grab_timeout).and_then(|frame| {
            let captured_at = SystemTime::now();
            self.sink
                .persist(&camera, sequence, frame)
                .map(|frame| (frame, captured_at))
        });

        let event = match result {
            Ok((frame, captured_at)) => CaptureEvent::Frame(FrameRecord {
                camera,
                sequence,
                frame,
                captured_at,
            }),
            Err(error) => {
                if error == CameraError::GrabTimeout {
                    log::debug!("camera {}: frame {} timed out", camera, sequence);
                } else {
                    log::warn!("camera {}: frame {} failed: {}", camera, sequence, error);
                }
                CaptureEvent::Skipped {
                    camera,
                    sequence,
                    error,
                }
            }
        };
        self.emit(event);
    }

    fn apply_pending(&mut self, index: usize) {
        let device = &mut self.devices[index];
        if let Some(overrides) = self.shared.take_pending(device.id()) {
            let applied = apply_live(device.as_mut(), &overrides);
            log::info!(
                "camera {}: live update (exposure {:?}, gain {:?})",
                device.id(),
                applied.exposure,
                applied.gain
            );
            let camera = device.id().clone();
            self.emit(CaptureEvent::Configured { camera, applied });
        }
    }

    fn finish(&mut self) {
        self.shared.advance(WorkerState::Stopping);
        for device in self.devices.iter_mut() {
            if let Err(error) = device.stop_stream() {
                log::debug!("camera {}: stop stream: {}", device.id(), error);
            }
        }
        let stopped = self.cancelled();
        self.shared.set_state(WorkerState::Stopped);
        log::info!("capture worker: finished (stopped: {})", stopped);
        let _ = self.events.send(CaptureEvent::Finished { stopped });
    }
}
