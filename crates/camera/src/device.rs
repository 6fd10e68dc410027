use {
    crate::{CameraError, CameraId, Frame},
    std::{fmt, time::Duration},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionMode {
    Continuous,
    SingleFrame,
}

/// How the driver hands out buffered frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferHandling {
    OldestFirst,
    NewestOnly,
}

/// Numeric parameters with device-reported bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumericParam {
    ExposureTime,
    Gain,
    Width,
    Height,
}

impl fmt::Display for NumericParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NumericParam::ExposureTime => write!(f, "ExposureTime"),
            NumericParam::Gain => write!(f, "Gain"),
            NumericParam::Width => write!(f, "Width"),
            NumericParam::Height => write!(f, "Height"),
        }
    }
}

/// A single device parameter write.
#[derive(Debug, Clone, PartialEq)]
pub enum Setting {
    ExposureAuto(bool),
    GainAuto(bool),
    TriggerMode(bool),
    AcquisitionMode(AcquisitionMode),
    BufferHandling(BufferHandling),
    Width(u32),
    Height(u32),
    PixelFormat(String),
    ExposureTime(f64),
    Gain(f64),
}

impl Setting {
    pub fn name(&self) -> &'static str {
        match self {
            Setting::ExposureAuto(_) => "ExposureAuto",
            Setting::GainAuto(_) => "GainAuto",
            Setting::TriggerMode(_) => "TriggerMode",
            Setting::AcquisitionMode(_) => "AcquisitionMode",
            Setting::BufferHandling(_) => "StreamBufferHandlingMode",
            Setting::Width(_) => "Width",
            Setting::Height(_) => "Height",
            Setting::PixelFormat(_) => "PixelFormat",
            Setting::ExposureTime(_) => "ExposureTime",
            Setting::Gain(_) => "Gain",
        }
    }
}

/// An open camera handle.
///
/// The capture worker owns each handle exclusively for the session, and every call happens on
/// the worker thread, so implementations need `Send` but not `Sync`.
pub trait CameraDevice: Send {
    fn id(&self) -> &CameraId;

    /// Start streaming. Starting a running stream is not an error.
    fn start_stream(&mut self) -> Result<(), CameraError>;

    /// Stop streaming. Implementations may fail with "already stopped"; callers ignore it.
    fn stop_stream(&mut self) -> Result<(), CameraError>;

    fn write(&mut self, setting: &Setting) -> Result<(), CameraError>;

    /// `(min, max)` as reported by the device, `None` when it does not report bounds.
    fn range(&self, param: NumericParam) -> Option<(f64, f64)>;

    /// Pull one frame, waiting at most `timeout`. A timeout is `CameraError::GrabTimeout`.
    fn grab(&mut self, timeout: Duration) -> Result<Frame, CameraError>;
}

/// Opens devices by id. Enumeration and driver bootstrapping live behind this trait.
pub trait DeviceProvider: Send + Sync {
    /// Fails with `CameraError::DeviceUnavailable` when the camera cannot be located or opened.
    fn open(&self, id: &CameraId) -> Result<Box<dyn CameraDevice>, CameraError>;
}
