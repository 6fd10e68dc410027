//! Inference Dispatch Queue.
//!
//! Producers append frames without ever blocking. At most one inference job runs at any time:
//! the `in_flight` flag and the pending FIFO share one lock, the producer that flips `in_flight`
//! starts a drain loop on a blocking thread, and that loop keeps taking the next frame until the
//! FIFO is empty. `in_flight` is only cleared under the same lock that observes the empty FIFO,
//! so a frame enqueued concurrently is either picked up by the running loop or starts a new one.

use {
    crate::{Detection, Detector, InferError},
    camera::{CameraId, FrameRecord, FrameRef},
    std::{
        collections::VecDeque,
        panic::{AssertUnwindSafe, catch_unwind},
        path::PathBuf,
        sync::{Arc, Mutex, MutexGuard},
        time::SystemTime,
    },
    tokio::{
        runtime::Handle,
        sync::{mpsc, watch},
    },
};

/// Score text of a result produced without a successful inference.
pub const FAIL_OPEN_SCORE: &str = "—";

/// Score text when nothing reached the defect threshold.
pub const GOOD_SCORE: &str = "OK";

// default pending depth above which a backlog warning is logged
const DEFAULT_BACKLOG_WARN: usize = 32;

#[derive(Debug, Clone)]
pub struct InferenceResult {
    pub camera: CameraId,
    pub sequence: u64,
    pub captured_at: SystemTime,
    /// The frame inference ran on: the staged copy when staging succeeded.
    pub input: FrameRef,
    /// The annotated image, or the input itself when the detector produced none.
    pub overlay: FrameRef,
    pub is_defect: bool,
    pub score_text: String,
    /// Class of the top detection at or above the threshold.
    pub class_name: Option<String>,
    pub detections: Vec<Detection>,
    /// Set on fail-open results.
    pub error: Option<InferError>,
}

impl InferenceResult {
    /// Turn detections into a verdict. `is_defect` when any detection reaches `threshold`.
    pub fn classify(
        frame: &FrameRecord,
        input: FrameRef,
        detections: Vec<Detection>,
        overlay: Option<FrameRef>,
        threshold: f32,
    ) -> Self {
        let top = detections
            .iter()
            .filter(|detection| detection.confidence >= threshold)
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence));
        let (is_defect, score_text, class_name) = match top {
            Some(top) => (
                true,
                format!("{} {:.2}", top.class_name, top.confidence),
                Some(top.class_name.clone()),
            ),
            None => (false, GOOD_SCORE.to_string(), None),
        };
        Self {
            camera: frame.camera.clone(),
            sequence: frame.sequence,
            captured_at: frame.captured_at,
            overlay: overlay.unwrap_or_else(|| input.clone()),
            input,
            is_defect,
            score_text,
            class_name,
            detections,
            error: None,
        }
    }

    /// The safe default: not a defect, overlay is the original frame.
    pub fn fail_open(frame: &FrameRecord, error: InferError) -> Self {
        Self {
            camera: frame.camera.clone(),
            sequence: frame.sequence,
            captured_at: frame.captured_at,
            input: frame.frame.clone(),
            overlay: frame.frame.clone(),
            is_defect: false,
            score_text: FAIL_OPEN_SCORE.to_string(),
            class_name: None,
            detections: Vec::new(),
            error: Some(error),
        }
    }

    pub fn is_fail_open(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    defect_threshold: f32,
    staging_dir: Option<PathBuf>,
    overlay_dir: Option<PathBuf>,
    backlog_warn: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            defect_threshold: 0.0,
            staging_dir: None,
            overlay_dir: None,
            backlog_warn: DEFAULT_BACKLOG_WARN,
        }
    }
}

impl DispatchConfig {
    pub fn with_defect_threshold(mut self, threshold: f32) -> Self {
        self.defect_threshold = threshold;
        self
    }

    /// Copy each input frame here before inference.
    pub fn with_staging_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.staging_dir = dir;
        self
    }

    /// Ask the detector to write overlays here.
    pub fn with_overlay_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.overlay_dir = dir;
        self
    }

    pub fn with_backlog_warn(mut self, depth: usize) -> Self {
        self.backlog_warn = depth;
        self
    }

    pub fn defect_threshold(&self) -> f32 {
        self.defect_threshold
    }

    pub fn backlog_warn(&self) -> usize {
        self.backlog_warn
    }
}

struct QueueState {
    pending: VecDeque<FrameRecord>,
    in_flight: bool,
    backlog_warned: bool,
}

struct Inner {
    detector: Arc<dyn Detector>,
    config: DispatchConfig,
    results: mpsc::UnboundedSender<InferenceResult>,
    state: Mutex<QueueState>,
    idle: watch::Sender<bool>,
    runtime: Handle,
}

/// Cheap to clone; all clones feed the same queue.
#[derive(Clone)]
pub struct DispatchQueue {
    inner: Arc<Inner>,
}

impl DispatchQueue {
    /// Create a queue delivering results on `results`. Must be called within a tokio runtime;
    /// inference jobs run on its blocking pool.
    pub fn new(
        detector: Arc<dyn Detector>,
        config: DispatchConfig,
        results: mpsc::UnboundedSender<InferenceResult>,
    ) -> Result<Self, InferError> {
        let runtime = Handle::try_current()
            .map_err(|e| InferError::Runtime(format!("dispatch queue needs a tokio runtime: {e}")))?;
        let (idle, _) = watch::channel(true);
        Ok(Self {
            inner: Arc::new(Inner {
                detector,
                config,
                results,
                state: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    in_flight: false,
                    backlog_warned: false,
                }),
                idle,
                runtime,
            }),
        })
    }

    /// Append `frame`. Never blocks on inference; starts a job if none is running.
    ///
    /// Returns the pending depth when this frame pushed the backlog past the warning depth.
    /// That happens once per crossing; the latch resets when the backlog falls back.
    pub fn enqueue(&self, frame: FrameRecord) -> Option<usize> {
        let (start, backlog) = {
            let mut state = self.inner.lock();
            state.pending.push_back(frame);
            let depth = state.pending.len();
            let warn_at = self.inner.config.backlog_warn;
            let mut backlog = None;
            if depth > warn_at && !state.backlog_warned {
                log::warn!("inference backlog: {} frames pending", depth);
                state.backlog_warned = true;
                backlog = Some(depth);
            } else if depth <= warn_at {
                state.backlog_warned = false;
            }
            let start = !state.in_flight;
            if start {
                state.in_flight = true;
                self.inner.idle.send_replace(false);
            }
            (start, backlog)
        };
        if start {
            let inner = Arc::clone(&self.inner);
            self.inner.runtime.spawn_blocking(move || inner.drain());
        }
        backlog
    }

    /// Frames waiting, not counting the one being inferred.
    pub fn depth(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn in_flight(&self) -> bool {
        self.inner.lock().in_flight
    }

    /// Drop every frame that has not started inference. The running job, if any, completes.
    pub fn discard_pending(&self) -> usize {
        let discarded = {
            let mut state = self.inner.lock();
            let discarded = state.pending.len();
            state.pending.clear();
            state.backlog_warned = false;
            discarded
        };
        if discarded > 0 {
            log::info!("dispatch queue: discarded {} pending frames", discarded);
        }
        discarded
    }

    /// Wait until nothing is pending or running.
    pub async fn wait_idle(&self) {
        let mut idle = self.inner.idle.subscribe();
        // the sender lives in `inner`, which we hold, so this cannot fail
        let _ = idle.wait_for(|idle| *idle).await;
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // pops the next frame, or clears in_flight when there is none
    fn next(&self) -> Option<FrameRecord> {
        let mut state = self.lock();
        match state.pending.pop_front() {
            Some(frame) => Some(frame),
            None => {
                state.in_flight = false;
                self.idle.send_replace(true);
                None
            }
        }
    }

    fn drain(&self) {
        while let Some(frame) = self.next() {
            let result = self.run(&frame);
            if self.results.send(result).is_err() {
                log::debug!("dispatch queue: result receiver dropped");
            }
        }
    }

    fn run(&self, frame: &FrameRecord) -> InferenceResult {
        let input = self.stage(frame);
        let overlay_path = self.config.overlay_dir.as_ref().map(|dir| {
            dir.join(format!("{}_{:06}_overlay.png", frame.camera.file_stem(), frame.sequence))
        });

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.detector.detect(&input, overlay_path.as_deref())
        }))
        .unwrap_or_else(|_| Err(InferError::Runtime("detector panicked".to_string())));

        match outcome {
            Ok(inference) => InferenceResult::classify(
                frame,
                input,
                inference.detections,
                inference.overlay,
                self.config.defect_threshold,
            ),
            Err(error) => {
                log::warn!(
                    "camera {}: inference on frame {} failed: {}",
                    frame.camera,
                    frame.sequence,
                    error
                );
                InferenceResult::fail_open(frame, error)
            }
        }
    }

    // copies the frame to the staging directory; falls back to the original on failure
    fn stage(&self, frame: &FrameRecord) -> FrameRef {
        let Some(dir) = &self.config.staging_dir else {
            return frame.frame.clone();
        };
        let path = dir.join(format!("{}_{:06}.png", frame.camera.file_stem(), frame.sequence));
        let staged = frame
            .frame
            .encoded()
            .map_err(|e| e.to_string())
            .and_then(|bytes| std::fs::write(&path, bytes).map_err(|e| e.to_string()));
        match staged {
            Ok(()) => FrameRef::File(path),
            Err(error) => {
                log::error!("camera {}: failed to stage frame {}: {}", frame.camera, frame.sequence, error);
                frame.frame.clone()
            }
        }
    }
}
