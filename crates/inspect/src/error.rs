use {
    camera::{CameraError, CameraId},
    std::{fmt, time::Duration},
};

#[derive(Debug, Clone, PartialEq)]
pub enum InferError {
    Backend(String),
    Io(String),
    Runtime(String),
    UnknownBackend(String),
}

impl fmt::Display for InferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InferError::Backend(msg) => write!(f, "backend error: {msg}"),
            InferError::Io(msg) => write!(f, "io error: {msg}"),
            InferError::Runtime(msg) => write!(f, "runtime error: {msg}"),
            InferError::UnknownBackend(name) => write!(f, "unknown inference backend: {name}"),
        }
    }
}

impl std::error::Error for InferError {}

impl From<std::io::Error> for InferError {
    fn from(err: std::io::Error) -> Self {
        InferError::Io(err.to_string())
    }
}

impl From<CameraError> for InferError {
    fn from(err: CameraError) -> Self {
        InferError::Backend(err.to_string())
    }
}

#[derive(Debug)]
pub enum PersistError {
    Io(String),
    Serialize(String),
}

impl fmt::Display for PersistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistError::Io(msg) => write!(f, "io error: {msg}"),
            PersistError::Serialize(msg) => write!(f, "serialize error: {msg}"),
        }
    }
}

impl std::error::Error for PersistError {}

impl From<std::io::Error> for PersistError {
    fn from(err: std::io::Error) -> Self {
        PersistError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for PersistError {
    fn from(err: serde_json::Error) -> Self {
        PersistError::Serialize(err.to_string())
    }
}

impl From<CameraError> for PersistError {
    fn from(err: CameraError) -> Self {
        PersistError::Io(err.to_string())
    }
}

#[derive(Debug)]
pub enum SessionError {
    /// Not a single camera could be opened; carries the reason for each one.
    NoDevices(Vec<(CameraId, CameraError)>),
    Camera(CameraError),
    Config(String),
    Io(String),
    Infer(InferError),
    /// The capture worker did not stop in time and was abandoned.
    StopTimeout(Duration),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::NoDevices(failures) => {
                write!(f, "no camera available")?;
                for (camera, error) in failures {
                    write!(f, "; {camera}: {error}")?;
                }
                Ok(())
            }
            SessionError::Camera(err) => write!(f, "camera error: {err}"),
            SessionError::Config(msg) => write!(f, "config error: {msg}"),
            SessionError::Io(msg) => write!(f, "io error: {msg}"),
            SessionError::Infer(err) => write!(f, "inference error: {err}"),
            SessionError::StopTimeout(timeout) => {
                write!(f, "capture did not stop within {} ms", timeout.as_millis())
            }
        }
    }
}

impl std::error::Error for SessionError {}

impl From<CameraError> for SessionError {
    fn from(err: CameraError) -> Self {
        match err {
            CameraError::StopTimeout(timeout) => SessionError::StopTimeout(timeout),
            other => SessionError::Camera(other),
        }
    }
}

impl From<InferError> for SessionError {
    fn from(err: InferError) -> Self {
        SessionError::Infer(err)
    }
}

impl From<PersistError> for SessionError {
    fn from(err: PersistError) -> Self {
        SessionError::Io(err.to_string())
    }
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Config(err.to_string())
    }
}
