//! Capture-and-inference coordination.
//!
//! A `Session` runs the camera capture worker, pushes every captured frame through a
//! single-flight `DispatchQueue` into a `Detector`, and folds the results into a
//! `SessionState` that the presentation layer reads as snapshots.

pub mod aggregator;
pub mod backend;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod recorder;
pub mod session;
pub mod store;

pub use aggregator::{Aggregator, SessionState};
pub use backend::{
    Backend, BackendRegistry, Detection, Detector, Inference, IntensityBackend, IntensityDetector,
    IntensityParams, ModelSource, NullBackend, NullDetector, create_registry, draw_boxes,
};
pub use config::{SessionConfig, SimulationConfig};
pub use dispatch::{DispatchConfig, DispatchQueue, FAIL_OPEN_SCORE, GOOD_SCORE, InferenceResult};
pub use error::{InferError, PersistError, SessionError};
pub use recorder::{InspectionRecord, JsonlRecorder, NullRecorder, Recorder};
pub use session::{Session, SessionBuilder, SessionEvent};
pub use store::{JsonOverrideStore, MemoryOverrideStore, OverrideStore};
