use {
    crate::{DispatchConfig, SessionError},
    camera::{
        CameraId, CaptureMode, CaptureRequest, OverrideMap, ParameterOverrides,
        sim::{SimProvider, SimSpec},
    },
    log::LevelFilter,
    serde::{Deserialize, Serialize},
    std::{collections::HashSet, path::{Path, PathBuf}, time::Duration},
};

/// Everything needed to start a session, loadable from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    cameras: Vec<CameraId>,
    mode: CaptureMode,
    frames_per_camera: i64,
    overrides: OverrideMap,
    grab_timeout_ms: u64,
    stop_timeout_ms: u64,
    defect_threshold: f32,
    backend: String,
    weights: Option<PathBuf>,
    frame_dir: Option<PathBuf>,
    staging_dir: Option<PathBuf>,
    overlay_dir: Option<PathBuf>,
    record_dir: Option<PathBuf>,
    backlog_warn: usize,
    log_level: Option<String>,
    log_dir: Option<PathBuf>,
    override_store: Option<PathBuf>,
    simulation: SimulationConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cameras: Vec::new(),
            mode: CaptureMode::AreaScan,
            frames_per_camera: 1,
            overrides: OverrideMap::new(),
            grab_timeout_ms: 1000,
            stop_timeout_ms: 5000,
            defect_threshold: 0.0,
            backend: "null".to_string(),
            weights: None,
            frame_dir: None,
            staging_dir: None,
            overlay_dir: None,
            record_dir: None,
            backlog_warn: 32,
            log_level: None,
            log_dir: None,
            override_store: None,
            simulation: SimulationConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn new(cameras: Vec<CameraId>, mode: CaptureMode) -> Self {
        Self {
            cameras,
            mode,
            ..Default::default()
        }
    }

    /// Read and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SessionError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| SessionError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.cameras.is_empty() {
            return Err(SessionError::Config("no cameras configured".to_string()));
        }
        let mut seen = HashSet::new();
        for camera in &self.cameras {
            if !seen.insert(camera) {
                return Err(SessionError::Config(format!("camera {} listed twice", camera)));
            }
        }
        if !self.defect_threshold.is_finite() {
            return Err(SessionError::Config("defect threshold must be finite".to_string()));
        }
        self.level_filter()?;
        Ok(())
    }

    /// Frames per camera; zero or less runs until stopped.
    pub fn with_frames_per_camera(mut self, frames: i64) -> Self {
        self.frames_per_camera = frames;
        self
    }

    pub fn with_overrides(mut self, overrides: OverrideMap) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_override(mut self, camera: impl Into<CameraId>, overrides: ParameterOverrides) -> Self {
        self.overrides.insert(camera.into(), overrides);
        self
    }

    pub fn with_grab_timeout(mut self, timeout: Duration) -> Self {
        self.grab_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Detections at or above this confidence make a frame a defect.
    pub fn with_defect_threshold(mut self, threshold: f32) -> Self {
        self.defect_threshold = threshold;
        self
    }

    pub fn with_backend(mut self, backend: impl Into<String>, weights: Option<PathBuf>) -> Self {
        self.backend = backend.into();
        self.weights = weights;
        self
    }

    pub fn with_frame_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.frame_dir = Some(dir.into());
        self
    }

    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = Some(dir.into());
        self
    }

    pub fn with_overlay_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.overlay_dir = Some(dir.into());
        self
    }

    pub fn with_record_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.record_dir = Some(dir.into());
        self
    }

    pub fn with_backlog_warn(mut self, depth: usize) -> Self {
        self.backlog_warn = depth;
        self
    }

    pub fn with_override_store(mut self, path: impl Into<PathBuf>) -> Self {
        self.override_store = Some(path.into());
        self
    }

    pub fn with_simulation(mut self, simulation: SimulationConfig) -> Self {
        self.simulation = simulation;
        self
    }

    pub fn cameras(&self) -> &[CameraId] {
        &self.cameras
    }

    pub fn mode(&self) -> CaptureMode {
        self.mode
    }

    pub fn frames_per_camera(&self) -> i64 {
        self.frames_per_camera
    }

    pub fn overrides(&self) -> &OverrideMap {
        &self.overrides
    }

    pub fn grab_timeout(&self) -> Duration {
        Duration::from_millis(self.grab_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn defect_threshold(&self) -> f32 {
        self.defect_threshold
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn weights(&self) -> Option<&Path> {
        self.weights.as_deref()
    }

    pub fn frame_dir(&self) -> Option<&Path> {
        self.frame_dir.as_deref()
    }

    pub fn staging_dir(&self) -> Option<&Path> {
        self.staging_dir.as_deref()
    }

    pub fn overlay_dir(&self) -> Option<&Path> {
        self.overlay_dir.as_deref()
    }

    pub fn record_dir(&self) -> Option<&Path> {
        self.record_dir.as_deref()
    }

    pub fn backlog_warn(&self) -> usize {
        self.backlog_warn
    }

    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }

    pub fn override_store(&self) -> Option<&Path> {
        self.override_store.as_deref()
    }

    pub fn simulation(&self) -> &SimulationConfig {
        &self.simulation
    }

    /// The configured log level; `None` leaves the build default.
    pub fn level_filter(&self) -> Result<Option<LevelFilter>, SessionError> {
        match &self.log_level {
            Some(level) => level
                .parse::<LevelFilter>()
                .map(Some)
                .map_err(|_| SessionError::Config(format!("unknown log level {}", level))),
            None => Ok(None),
        }
    }

    /// Per-camera overrides with `stored` values underneath the configured ones.
    pub fn merged_overrides(&self, stored: &OverrideMap) -> OverrideMap {
        self.cameras
            .iter()
            .filter_map(|camera| {
                let configured = self.overrides.get(camera);
                let merged = match (stored.get(camera), configured) {
                    (Some(stored), Some(configured)) => stored.merged(configured),
                    (Some(stored), None) => stored.clone(),
                    (None, Some(configured)) => configured.clone(),
                    (None, None) => return None,
                };
                Some((camera.clone(), merged))
            })
            .collect()
    }

    pub fn capture_request(&self, overrides: OverrideMap) -> CaptureRequest {
        CaptureRequest::new(self.cameras.clone(), self.mode)
            .with_frames_per_camera(self.frames_per_camera)
            .with_overrides(overrides)
            .with_grab_timeout(self.grab_timeout())
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig::default()
            .with_defect_threshold(self.defect_threshold)
            .with_staging_dir(self.staging_dir.clone())
            .with_overlay_dir(self.overlay_dir.clone())
            .with_backlog_warn(self.backlog_warn)
    }
}

/// Simulated cameras for the `inspect` binary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Camera ids that fail to open.
    pub unavailable: Vec<CameraId>,
    /// Every n-th frame carries a dark spot.
    pub dark_spot_every: Option<u64>,
    pub grab_delay_ms: u64,
    pub exposure_max: Option<f64>,
}

impl SimulationConfig {
    pub fn provider(&self) -> SimProvider {
        let defaults = SimSpec::default();
        let exposure_range = match (defaults.exposure_range, self.exposure_max) {
            (Some((min, _)), Some(max)) => Some((min, max)),
            (range, _) => range,
        };
        let spec = SimSpec {
            exposure_range,
            grab_delay: Duration::from_millis(self.grab_delay_ms),
            dark_spot_every: self.dark_spot_every,
            ..defaults
        };
        self.unavailable
            .iter()
            .fold(SimProvider::new().with_default_spec(spec), |provider, camera| {
                provider.with_unavailable(camera.clone())
            })
    }
}
