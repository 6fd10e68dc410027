//! Simulated camera backend.
//!
//! Produces synthetic gradient frames and behaves like a strict device: it refuses
//! out-of-range values, can be told to reject specific settings, to time out on chosen grab
//! attempts, or to be missing altogether. Every accepted write is recorded so callers can see
//! exactly what reached the "hardware".

use {
    crate::{
        AcquisitionMode, CameraDevice, CameraError, CameraId, DeviceProvider, Frame, NumericParam,
        PixelFormat, Setting,
    },
    base::Vec2,
    std::{
        collections::{HashMap, HashSet},
        sync::{
            Arc, Mutex,
            atomic::{AtomicU64, Ordering},
        },
        time::Duration,
    },
};

#[derive(Debug, Clone)]
pub struct SimSpec {
    /// Maximum (and initial) width and height.
    pub sensor: Vec2<u32>,
    pub exposure_range: Option<(f64, f64)>,
    pub gain_range: Option<(f64, f64)>,
    /// Setting names this device refuses, e.g. `"GainAuto"`.
    pub reject: Vec<&'static str>,
    /// Zero-based grab attempts that time out.
    pub timeout_on: Vec<u64>,
    pub grab_delay: Duration,
    /// Every n-th attempt carries a dark square in the middle of the frame.
    pub dark_spot_every: Option<u64>,
}

impl Default for SimSpec {
    fn default() -> Self {
        Self {
            sensor: Vec2::new(64, 48),
            exposure_range: Some((20.0, 1_000_000.0)),
            gain_range: Some((0.0, 24.0)),
            reject: Vec::new(),
            timeout_on: Vec::new(),
            grab_delay: Duration::ZERO,
            dark_spot_every: None,
        }
    }
}

type WriteLog = Arc<Mutex<Vec<(CameraId, Setting)>>>;

/// Opens `SimCamera`s. Ids without a registered spec get the default spec.
#[derive(Debug, Default)]
pub struct SimProvider {
    specs: HashMap<CameraId, SimSpec>,
    default_spec: SimSpec,
    unavailable: HashSet<CameraId>,
    writes: WriteLog,
    grabs: Arc<AtomicU64>,
}

impl SimProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_camera(mut self, id: impl Into<CameraId>, spec: SimSpec) -> Self {
        self.specs.insert(id.into(), spec);
        self
    }

    pub fn with_default_spec(mut self, spec: SimSpec) -> Self {
        self.default_spec = spec;
        self
    }

    /// Make `id` fail to open with `DeviceUnavailable`.
    pub fn with_unavailable(mut self, id: impl Into<CameraId>) -> Self {
        self.unavailable.insert(id.into());
        self
    }

    /// Accepted writes so far, in order, across all cameras.
    pub fn writes(&self) -> Vec<(CameraId, Setting)> {
        self.writes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Grab calls started so far, across all cameras.
    pub fn grabs(&self) -> u64 {
        self.grabs.load(Ordering::SeqCst)
    }

    pub fn writes_for(&self, id: &CameraId) -> Vec<Setting> {
        self.writes()
            .into_iter()
            .filter(|(camera, _)| camera == id)
            .map(|(_, setting)| setting)
            .collect()
    }
}

impl DeviceProvider for SimProvider {
    fn open(&self, id: &CameraId) -> Result<Box<dyn CameraDevice>, CameraError> {
        if self.unavailable.contains(id) {
            return Err(CameraError::DeviceUnavailable(format!("camera {} not found", id)));
        }
        let spec = self.specs.get(id).cloned().unwrap_or_else(|| self.default_spec.clone());
        Ok(Box::new(SimCamera::new(
            id.clone(),
            spec,
            Arc::clone(&self.writes),
            Arc::clone(&self.grabs),
        )))
    }
}

pub struct SimCamera {
    id: CameraId,
    spec: SimSpec,
    size: Vec2<u32>,
    format: PixelFormat,
    acquisition: AcquisitionMode,
    streaming: bool,
    attempts: u64,
    writes: WriteLog,
    grabs: Arc<AtomicU64>,
}

impl SimCamera {
    fn new(id: CameraId, spec: SimSpec, writes: WriteLog, grabs: Arc<AtomicU64>) -> Self {
        Self {
            id,
            size: spec.sensor,
            spec,
            format: PixelFormat::Mono8,
            acquisition: AcquisitionMode::Continuous,
            streaming: false,
            attempts: 0,
            writes,
            grabs,
        }
    }

    fn check_range(&self, setting: &Setting, value: f64, range: Option<(f64, f64)>) -> Result<(), CameraError> {
        match range {
            Some((min, max)) if value < min || value > max => Err(CameraError::ParameterRejected(
                format!("{} {} outside [{}, {}]", setting.name(), value, min, max),
            )),
            _ => Ok(()),
        }
    }

    fn render(&self, attempt: u64) -> Result<Frame, CameraError> {
        let (width, height) = (self.size.x as usize, self.size.y as usize);
        let channels = self.format.channels();
        let mut data = Vec::with_capacity(width * height * channels);
        for y in 0..height {
            for x in 0..width {
                let value = 64 + ((x + y + attempt as usize) % 128) as u8;
                data.extend(std::iter::repeat_n(value, channels));
            }
        }
        let spotted = matches!(self.spec.dark_spot_every, Some(n) if n > 0 && attempt % n == 0);
        if spotted && width >= 4 && height >= 4 {
            let (cx, cy) = (width / 2, height / 2);
            for y in cy - 2..cy + 2 {
                for x in cx - 2..cx + 2 {
                    let start = (y * width + x) * channels;
                    data[start..start + channels].fill(0);
                }
            }
        }
        Frame::new(Vec2::new(width, height), self.format, data)
    }
}

impl CameraDevice for SimCamera {
    fn id(&self) -> &CameraId {
        &self.id
    }

    fn start_stream(&mut self) -> Result<(), CameraError> {
        self.streaming = true;
        Ok(())
    }

    fn stop_stream(&mut self) -> Result<(), CameraError> {
        if !self.streaming {
            return Err(CameraError::Stream("already stopped".to_string()));
        }
        self.streaming = false;
        Ok(())
    }

    fn write(&mut self, setting: &Setting) -> Result<(), CameraError> {
        if self.spec.reject.contains(&setting.name()) {
            return Err(CameraError::ParameterRejected(format!(
                "{} not supported",
                setting.name()
            )));
        }
        match setting {
            Setting::Width(width) => {
                if *width == 0 || *width > self.spec.sensor.x {
                    return Err(CameraError::ParameterRejected(format!("Width {}", width)));
                }
                self.size.x = *width;
            }
            Setting::Height(height) => {
                if *height == 0 || *height > self.spec.sensor.y {
                    return Err(CameraError::ParameterRejected(format!("Height {}", height)));
                }
                self.size.y = *height;
            }
            Setting::PixelFormat(name) => {
                self.format = PixelFormat::from_name(name)
                    .ok_or_else(|| CameraError::ParameterRejected(format!("PixelFormat {}", name)))?;
            }
            Setting::ExposureTime(value) => {
                self.check_range(setting, *value, self.spec.exposure_range)?
            }
            Setting::Gain(value) => self.check_range(setting, *value, self.spec.gain_range)?,
            Setting::AcquisitionMode(mode) => self.acquisition = *mode,
            Setting::ExposureAuto(_)
            | Setting::GainAuto(_)
            | Setting::TriggerMode(_)
            | Setting::BufferHandling(_) => {}
        }
        self.writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((self.id.clone(), setting.clone()));
        Ok(())
    }

    fn range(&self, param: NumericParam) -> Option<(f64, f64)> {
        match param {
            NumericParam::ExposureTime => self.spec.exposure_range,
            NumericParam::Gain => self.spec.gain_range,
            NumericParam::Width => Some((1.0, self.spec.sensor.x as f64)),
            NumericParam::Height => Some((1.0, self.spec.sensor.y as f64)),
        }
    }

    fn grab(&mut self, timeout: Duration) -> Result<Frame, CameraError> {
        let attempt = self.attempts;
        self.attempts += 1;
        self.grabs.fetch_add(1, Ordering::SeqCst);

        if !self.spec.grab_delay.is_zero() {
            std::thread::sleep(self.spec.grab_delay.min(timeout));
        }
        if self.spec.timeout_on.contains(&attempt) {
            return Err(CameraError::GrabTimeout);
        }
        if self.acquisition == AcquisitionMode::Continuous && !self.streaming {
            return Err(CameraError::Stream("stream not started".to_string()));
        }
        self.render(attempt)
    }
}
