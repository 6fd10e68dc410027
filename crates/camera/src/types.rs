use {
    crate::CameraError,
    base::Vec2,
    crates_image::{ExtendedColorType, ImageEncoder, codecs::png::PngEncoder},
    serde::{Deserialize, Serialize},
    std::{collections::HashMap, fmt, path::PathBuf, sync::Arc, time::SystemTime},
};

/// Identifies a physical camera for the duration of one session.
///
/// Ids are only stable within a session; the next session may enumerate devices differently.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CameraId(String);

impl CameraId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The id as a file name fragment over `[A-Za-z0-9_-]`.
    ///
    /// Alphanumerics and `-` pass through; every other byte, `_` included, becomes `_xx` in
    /// hex. Distinct ids therefore never share a stem.
    pub fn file_stem(&self) -> String {
        let mut stem = String::with_capacity(self.0.len());
        for byte in self.0.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' {
                stem.push(byte as char);
            } else {
                stem.push_str(&format!("_{:02x}", byte));
            }
        }
        stem
    }
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CameraId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for CameraId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u32> for CameraId {
    fn from(index: u32) -> Self {
        Self(index.to_string())
    }
}

/// Acquisition variant; fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    AreaScan,
    LineScan,
    ContinuousAreaScan,
}

impl CaptureMode {
    /// Whether single-shot grabs pull from a stream that is left running after configuration.
    pub fn requires_running_stream(&self) -> bool {
        match self {
            CaptureMode::AreaScan | CaptureMode::ContinuousAreaScan => true,
            CaptureMode::LineScan => false,
        }
    }
}

impl fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureMode::AreaScan => write!(f, "area scan"),
            CaptureMode::LineScan => write!(f, "line scan"),
            CaptureMode::ContinuousAreaScan => write!(f, "continuous area scan"),
        }
    }
}

/// Operator choices for one camera. Unset fields keep the mode defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParameterOverrides {
    /// Exposure time in microseconds.
    pub exposure: Option<f64>,
    /// Gain in dB.
    pub gain: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub pixel_format: Option<String>,
}

impl ParameterOverrides {
    pub fn is_empty(&self) -> bool {
        self.exposure.is_none()
            && self.gain.is_none()
            && self.width.is_none()
            && self.height.is_none()
            && self.pixel_format.is_none()
    }

    /// Fields set in `over` replace the ones in `self`.
    pub fn merged(&self, over: &ParameterOverrides) -> ParameterOverrides {
        ParameterOverrides {
            exposure: over.exposure.or(self.exposure),
            gain: over.gain.or(self.gain),
            width: over.width.or(self.width),
            height: over.height.or(self.height),
            pixel_format: over.pixel_format.clone().or_else(|| self.pixel_format.clone()),
        }
    }
}

pub type OverrideMap = HashMap<CameraId, ParameterOverrides>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Mono8,
    Rgb8,
}

impl PixelFormat {
    /// Parse a device pixel format name (`Mono8`, `RGB8`, case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "mono8" => Some(PixelFormat::Mono8),
            "rgb8" | "rgb8packed" => Some(PixelFormat::Rgb8),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PixelFormat::Mono8 => "Mono8",
            PixelFormat::Rgb8 => "RGB8",
        }
    }

    pub fn channels(&self) -> usize {
        match self {
            PixelFormat::Mono8 => 1,
            PixelFormat::Rgb8 => 3,
        }
    }
}

/// A raw image as pulled from a device, HWC layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub size: Vec2<usize>,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(size: Vec2<usize>, format: PixelFormat, data: Vec<u8>) -> Result<Self, CameraError> {
        let expected = size.product() * format.channels();
        if data.len() != expected {
            return Err(CameraError::Stream(format!(
                "frame of {} needs {} bytes, got {}",
                size,
                expected,
                data.len()
            )));
        }
        Ok(Self { size, format, data })
    }

    /// Encode as PNG.
    pub fn to_png(&self) -> Result<Vec<u8>, CameraError> {
        let color = match self.format {
            PixelFormat::Mono8 => ExtendedColorType::L8,
            PixelFormat::Rgb8 => ExtendedColorType::Rgb8,
        };
        let mut buffer = Vec::new();
        PngEncoder::new(&mut buffer).write_image(
            &self.data,
            self.size.x as u32,
            self.size.y as u32,
            color,
        )?;
        Ok(buffer)
    }

    /// Decode any format the `image` crate understands; color images become RGB8.
    pub fn from_encoded(bytes: &[u8]) -> Result<Self, CameraError> {
        let image = crates_image::load_from_memory(bytes)?;
        let size = Vec2::new(image.width() as usize, image.height() as usize);
        match image {
            crates_image::DynamicImage::ImageLuma8(buf) => {
                Frame::new(size, PixelFormat::Mono8, buf.into_raw())
            }
            other => Frame::new(size, PixelFormat::Rgb8, other.to_rgb8().into_raw()),
        }
    }
}

/// Where a frame (or an overlay) lives.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameRef {
    File(PathBuf),
    Memory(Arc<Frame>),
}

impl FrameRef {
    pub fn load(&self) -> Result<Arc<Frame>, CameraError> {
        match self {
            FrameRef::File(path) => Ok(Arc::new(Frame::from_encoded(&std::fs::read(path)?)?)),
            FrameRef::Memory(frame) => Ok(Arc::clone(frame)),
        }
    }

    /// Encoded image bytes: the file contents, or PNG for in-memory frames.
    pub fn encoded(&self) -> Result<Vec<u8>, CameraError> {
        match self {
            FrameRef::File(path) => Ok(std::fs::read(path)?),
            FrameRef::Memory(frame) => frame.to_png(),
        }
    }

    pub fn file_name(&self) -> Option<String> {
        match self {
            FrameRef::File(path) => path.file_name().map(|n| n.to_string_lossy().into_owned()),
            FrameRef::Memory(_) => None,
        }
    }
}

/// One captured frame, owned by whoever holds it: the worker, then the dispatch queue.
#[derive(Debug, Clone)]
pub struct FrameRecord {
    pub camera: CameraId,
    /// Monotonic per camera; skipped grabs leave gaps.
    pub sequence: u64,
    pub frame: FrameRef,
    pub captured_at: SystemTime,
}
