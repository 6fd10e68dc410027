//! Camera side of the inspection pipeline.
//!
//! Devices are driven through the `CameraDevice` trait. `configure` turns a capture mode and
//! operator overrides into parameter writes, and `CaptureWorker` runs the acquisition loop on
//! its own thread, reporting everything it does as `CaptureEvent`s.

pub mod configure;
pub mod device;
pub mod error;
pub mod sim;
pub mod sink;
pub mod types;
pub mod worker;

pub use configure::{AppliedParameters, Clamped, apply_live, clamp, configure};
pub use device::{AcquisitionMode, BufferHandling, CameraDevice, DeviceProvider, NumericParam, Setting};
pub use error::{CameraError, ErrorKind};
pub use sink::{DirectorySink, FrameSink, MemorySink, create_run_dir};
pub use types::{
    CameraId, CaptureMode, Frame, FrameRecord, FrameRef, OverrideMap, ParameterOverrides, PixelFormat,
};
pub use worker::{CaptureEvent, CaptureRequest, CaptureWorker, WorkerState};
