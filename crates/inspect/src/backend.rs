//! Inference backends.
//!
//! The dispatch queue only sees `Detector`: image in, detections (and maybe an overlay) out.
//! Backends are looked up by name in a `BackendRegistry` and turn a model reference into a
//! ready `Detector`.

use {
    crate::InferError,
    base::{Rect, Vec2},
    camera::{Frame, FrameRef, PixelFormat},
    serde::{Deserialize, Serialize},
    std::{
        collections::HashMap,
        path::{Path, PathBuf},
        sync::Arc,
    },
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_name: String,
    pub confidence: f32,
    pub bbox: Rect<usize>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inference {
    pub detections: Vec<Detection>,
    /// Annotated image, when the detector produced one.
    pub overlay: Option<FrameRef>,
}

/// The inference function. Called from one blocking thread at a time; may take as long as it
/// needs.
pub trait Detector: Send + Sync {
    /// Run on `frame`. When `overlay` is given, an annotated image may be written there.
    fn detect(&self, frame: &FrameRef, overlay: Option<&Path>) -> Result<Inference, InferError>;
}

pub enum ModelSource {
    File(PathBuf),
    Memory(Vec<u8>),
}

impl ModelSource {
    pub fn bytes(&self) -> Result<Vec<u8>, InferError> {
        match self {
            ModelSource::File(path) => Ok(std::fs::read(path)?),
            ModelSource::Memory(bytes) => Ok(bytes.clone()),
        }
    }
}

pub trait Backend: Send + Sync {
    fn name(&self) -> &str;
    fn load_model(&self, model: Option<ModelSource>) -> Result<Arc<dyn Detector>, InferError>;
}

pub struct BackendRegistry {
    backends: HashMap<String, Box<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
        }
    }

    pub fn register(&mut self, backend: Box<dyn Backend>) {
        let name = backend.name().to_string();
        self.backends.insert(name, backend);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Backend> {
        self.backends.get(name).map(|b| &**b as &dyn Backend)
    }

    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.backends.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Look up `name` and load `model` with it.
    pub fn load(&self, name: &str, model: Option<ModelSource>) -> Result<Arc<dyn Detector>, InferError> {
        let backend = self
            .get(name)
            .ok_or_else(|| InferError::UnknownBackend(name.to_string()))?;
        log::info!("loading inference backend {}", name);
        backend.load_model(model)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry with the built-in backends.
pub fn create_registry() -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    registry.register(Box::new(NullBackend));
    registry.register(Box::new(IntensityBackend));
    registry
}

/// Finds nothing, ever. Every frame comes out GOOD.
pub struct NullBackend;

impl Backend for NullBackend {
    fn name(&self) -> &str {
        "null"
    }

    fn load_model(&self, _model: Option<ModelSource>) -> Result<Arc<dyn Detector>, InferError> {
        Ok(Arc::new(NullDetector))
    }
}

pub struct NullDetector;

impl Detector for NullDetector {
    fn detect(&self, _frame: &FrameRef, _overlay: Option<&Path>) -> Result<Inference, InferError> {
        Ok(Inference::default())
    }
}

/// Thresholds for `IntensityDetector`, loaded as JSON from the model reference.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntensityParams {
    /// Pixels darker than this count as defective.
    pub floor: u8,
    /// Fewer dark pixels than this is noise.
    pub min_pixels: usize,
}

impl Default for IntensityParams {
    fn default() -> Self {
        Self {
            floor: 32,
            min_pixels: 4,
        }
    }
}

pub struct IntensityBackend;

impl Backend for IntensityBackend {
    fn name(&self) -> &str {
        "intensity"
    }

    fn load_model(&self, model: Option<ModelSource>) -> Result<Arc<dyn Detector>, InferError> {
        let params = match model {
            Some(model) => serde_json::from_slice(&model.bytes()?)
                .map_err(|e| InferError::Backend(format!("invalid intensity parameters: {e}")))?,
            None => IntensityParams::default(),
        };
        Ok(Arc::new(IntensityDetector::new(params)))
    }
}

/// Reports one `dark_spot` around all pixels below the intensity floor.
pub struct IntensityDetector {
    params: IntensityParams,
}

impl IntensityDetector {
    pub const CLASS_NAME: &'static str = "dark_spot";

    pub fn new(params: IntensityParams) -> Self {
        Self { params }
    }

    fn find(&self, frame: &Frame) -> Option<Detection> {
        let channels = frame.format.channels();
        let mut count = 0;
        let mut bbox: Option<Rect<usize>> = None;
        for (index, pixel) in frame.data.chunks_exact(channels).enumerate() {
            let luma = pixel.iter().map(|&v| v as usize).sum::<usize>() / channels;
            if luma < self.params.floor as usize {
                count += 1;
                let point = Rect::new(
                    Vec2::new(index % frame.size.x, index / frame.size.x),
                    Vec2::new(1, 1),
                );
                bbox = Some(match bbox {
                    Some(bbox) => bbox.union(&point),
                    None => point,
                });
            }
        }
        let bbox = bbox?;
        if count < self.params.min_pixels {
            return None;
        }
        Some(Detection {
            class_name: Self::CLASS_NAME.to_string(),
            confidence: count as f32 / bbox.size.product() as f32,
            bbox,
        })
    }
}

impl Detector for IntensityDetector {
    fn detect(&self, frame: &FrameRef, overlay: Option<&Path>) -> Result<Inference, InferError> {
        let image = frame.load()?;
        let detections: Vec<Detection> = self.find(&image).into_iter().collect();

        let overlay = match overlay {
            Some(path) => {
                let annotated = draw_boxes(&image, &detections);
                std::fs::write(path, annotated.to_png()?)?;
                Some(FrameRef::File(path.to_path_buf()))
            }
            None => None,
        };
        Ok(Inference { detections, overlay })
    }
}

/// Copy of `frame` in RGB with a red outline around each detection.
pub fn draw_boxes(frame: &Frame, detections: &[Detection]) -> Frame {
    let bounds = Rect::new(Vec2::new(0, 0), frame.size);
    let mut data = match frame.format {
        PixelFormat::Rgb8 => frame.data.clone(),
        PixelFormat::Mono8 => frame.data.iter().flat_map(|&v| [v, v, v]).collect(),
    };
    for detection in detections {
        let (min, max) = (detection.bbox.min(), detection.bbox.max());
        for y in min.y..max.y {
            for x in min.x..max.x {
                let edge = x == min.x || y == min.y || x + 1 == max.x || y + 1 == max.y;
                if edge && bounds.contains(Vec2::new(x, y)) {
                    let start = (y * frame.size.x + x) * 3;
                    data[start..start + 3].copy_from_slice(&[255, 0, 0]);
                }
            }
        }
    }
    Frame {
        size: frame.size,
        format: PixelFormat::Rgb8,
        data,
    }
}
