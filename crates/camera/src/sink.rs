use {
    crate::{CameraError, CameraId, Frame, FrameRef},
    std::{
        fs,
        path::{Path, PathBuf},
        sync::Arc,
        time::{SystemTime, UNIX_EPOCH},
    },
};

/// Create a fresh `<parent>/run-<unix ms>` directory for one session.
///
/// Sequence numbers restart with every session, so each session writes into its own run
/// directory. A name that is already taken gets a `-1`, `-2`, ... suffix.
pub fn create_run_dir(parent: impl AsRef<Path>) -> Result<PathBuf, CameraError> {
    let parent = parent.as_ref();
    fs::create_dir_all(parent)?;
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let mut attempt = 0u32;
    loop {
        let name = match attempt {
            0 => format!("run-{}", millis),
            n => format!("run-{}-{}", millis, n),
        };
        let dir = parent.join(name);
        match fs::create_dir(&dir) {
            Ok(()) => return Ok(dir),
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => attempt += 1,
            Err(error) => return Err(error.into()),
        }
    }
}

/// Destination for captured frames, chosen by the caller of the capture worker.
pub trait FrameSink: Send + Sync {
    fn persist(&self, camera: &CameraId, sequence: u64, frame: Frame) -> Result<FrameRef, CameraError>;
}

/// Keeps frames in memory; nothing touches the disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemorySink;

impl FrameSink for MemorySink {
    fn persist(&self, _camera: &CameraId, _sequence: u64, frame: Frame) -> Result<FrameRef, CameraError> {
        Ok(FrameRef::Memory(Arc::new(frame)))
    }
}

/// Writes each frame as `<dir>/<camera>_<sequence>.png`.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CameraError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Write into a new run directory under `parent`, see `create_run_dir`.
    pub fn for_run(parent: impl AsRef<Path>) -> Result<Self, CameraError> {
        Ok(Self {
            dir: create_run_dir(parent)?,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, camera: &CameraId, sequence: u64) -> PathBuf {
        self.dir.join(format!("{}_{:06}.png", camera.file_stem(), sequence))
    }
}

impl FrameSink for DirectorySink {
    fn persist(&self, camera: &CameraId, sequence: u64, frame: Frame) -> Result<FrameRef, CameraError> {
        let path = self.path_for(camera, sequence);
        fs::write(&path, frame.to_png()?)?;
        Ok(FrameRef::File(path))
    }
}

#[cfg(test)]
mod tests {
    use {super::*, base::Vec2, crate::PixelFormat};

    #[test]
    fn test_run_dirs_never_repeat() {
        let parent = std::env::temp_dir().join(format!("camera_runs_{}", std::process::id()));
        let _ = fs::remove_dir_all(&parent);

        let first = DirectorySink::for_run(&parent).unwrap();
        let second = DirectorySink::for_run(&parent).unwrap();
        assert_ne!(first.dir(), second.dir());

        let camera = CameraId::from("a");
        let big = Frame::new(Vec2::new(4, 4), PixelFormat::Mono8, vec![7; 16]).unwrap();
        let small = Frame::new(Vec2::new(2, 2), PixelFormat::Mono8, vec![9; 4]).unwrap();
        let kept = first.persist(&camera, 0, big).unwrap();
        second.persist(&camera, 0, small).unwrap();
        assert_eq!(kept.load().unwrap().size, Vec2::new(4, 4));

        let _ = fs::remove_dir_all(&parent);
    }
}
