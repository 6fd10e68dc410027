use std::{fmt, time::Duration};

/// How the pipeline treats a failure.
///
/// Only `DeviceUnavailable` can end a session, and only when it hits every camera.
/// Everything else is absorbed where it happens and reported as an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    DeviceUnavailable,
    GrabTimeout,
    ParameterRejected,
    InferenceFailure,
    QueueBacklog,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::DeviceUnavailable => write!(f, "device unavailable"),
            ErrorKind::GrabTimeout => write!(f, "grab timeout"),
            ErrorKind::ParameterRejected => write!(f, "parameter rejected"),
            ErrorKind::InferenceFailure => write!(f, "inference failure"),
            ErrorKind::QueueBacklog => write!(f, "queue backlog"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CameraError {
    DeviceUnavailable(String),
    GrabTimeout,
    ParameterRejected(String),
    Stream(String),
    Io(String),
    Encode(String),
    /// The capture thread did not finish within the stop deadline and was abandoned.
    StopTimeout(Duration),
}

impl CameraError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            CameraError::DeviceUnavailable(_) => Some(ErrorKind::DeviceUnavailable),
            CameraError::GrabTimeout => Some(ErrorKind::GrabTimeout),
            CameraError::ParameterRejected(_) => Some(ErrorKind::ParameterRejected),
            CameraError::Stream(_)
            | CameraError::Io(_)
            | CameraError::Encode(_)
            | CameraError::StopTimeout(_) => None,
        }
    }
}

impl fmt::Display for CameraError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraError::DeviceUnavailable(msg) => write!(f, "device unavailable: {msg}"),
            CameraError::GrabTimeout => write!(f, "grab timed out"),
            CameraError::ParameterRejected(msg) => write!(f, "parameter rejected: {msg}"),
            CameraError::Stream(msg) => write!(f, "stream error: {msg}"),
            CameraError::Io(msg) => write!(f, "io error: {msg}"),
            CameraError::Encode(msg) => write!(f, "encode error: {msg}"),
            CameraError::StopTimeout(timeout) => {
                write!(f, "capture did not stop within {} ms", timeout.as_millis())
            }
        }
    }
}

impl std::error::Error for CameraError {}

impl From<std::io::Error> for CameraError {
    fn from(err: std::io::Error) -> Self {
        CameraError::Io(err.to_string())
    }
}

impl From<crates_image::ImageError> for CameraError {
    fn from(err: crates_image::ImageError) -> Self {
        CameraError::Encode(err.to_string())
    }
}
