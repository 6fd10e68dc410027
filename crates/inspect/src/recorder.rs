use {
    crate::{InferenceResult, PersistError, SessionState},
    camera::create_run_dir,
    serde::Serialize,
    std::{
        fs::{self, File, OpenOptions},
        io::Write,
        path::{Path, PathBuf},
        sync::Mutex,
        time::UNIX_EPOCH,
    },
};

/// One completed inspection, as handed to persistence.
#[derive(Debug, Clone, Serialize)]
pub struct InspectionRecord {
    pub camera: String,
    pub slot: Option<usize>,
    pub sequence: u64,
    pub good_count: u64,
    pub bad_count: u64,
    pub cycle: u64,
    pub is_defect: bool,
    pub score_text: String,
    pub class_name: Option<String>,
    pub input_name: String,
    pub overlay_name: String,
    /// Capture time, milliseconds since the unix epoch.
    pub captured_at_ms: u64,
    #[serde(skip)]
    pub input: Vec<u8>,
    #[serde(skip)]
    pub overlay: Vec<u8>,
}

impl InspectionRecord {
    /// Gather the record for `result`, reading image bytes. `state` is the snapshot taken right
    /// after the result was counted.
    pub fn new(result: &InferenceResult, state: &SessionState) -> Result<Self, PersistError> {
        let stem = format!("{}_{:06}", result.camera.file_stem(), result.sequence);
        let captured_at_ms = result
            .captured_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Ok(Self {
            camera: result.camera.to_string(),
            slot: state.slot(&result.camera),
            sequence: result.sequence,
            good_count: state.good_count,
            bad_count: state.bad_count,
            cycle: state.cycle_count,
            is_defect: result.is_defect,
            score_text: result.score_text.clone(),
            class_name: result.class_name.clone(),
            input_name: format!("{stem}.png"),
            overlay_name: format!("{stem}_overlay.png"),
            captured_at_ms,
            input: result.input.encoded()?,
            overlay: result.overlay.encoded()?,
        })
    }
}

/// Persistence collaborator. Called off the async runtime, one record at a time.
pub trait Recorder: Send + Sync {
    fn record(&self, record: &InspectionRecord) -> Result<(), PersistError>;
}

pub struct NullRecorder;

impl Recorder for NullRecorder {
    fn record(&self, _record: &InspectionRecord) -> Result<(), PersistError> {
        Ok(())
    }
}

/// Appends one JSON line per record to `<dir>/inspections.jsonl`.
///
/// Images go into a run directory of their own under `dir`, so a later session sharing the
/// log never overwrites them. Each line carries the image paths relative to `dir`.
pub struct JsonlRecorder {
    dir: PathBuf,
    run: String,
    file: Mutex<File>,
}

#[derive(Serialize)]
struct LogLine<'a> {
    #[serde(flatten)]
    record: &'a InspectionRecord,
    input_path: String,
    overlay_path: String,
}

impl JsonlRecorder {
    pub const LOG_NAME: &'static str = "inspections.jsonl";

    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let dir = dir.into();
        let run_dir = create_run_dir(&dir)?;
        let run = run_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(Self::LOG_NAME))?;
        log::info!("recording inspections into {}", run_dir.display());
        Ok(Self {
            dir,
            run,
            file: Mutex::new(file),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Directory holding this recorder's images, relative to `dir()`.
    pub fn run(&self) -> &str {
        &self.run
    }
}

impl Recorder for JsonlRecorder {
    fn record(&self, record: &InspectionRecord) -> Result<(), PersistError> {
        let input_path = format!("{}/{}", self.run, record.input_name);
        let overlay_path = format!("{}/{}", self.run, record.overlay_name);
        fs::write(self.dir.join(&input_path), &record.input)?;
        fs::write(self.dir.join(&overlay_path), &record.overlay)?;
        let mut line = serde_json::to_string(&LogLine {
            record,
            input_path,
            overlay_path,
        })?;
        line.push('\n');
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        base::Vec2,
        camera::{CameraId, Frame, FrameRecord, FrameRef, PixelFormat},
        std::{sync::Arc, time::SystemTime},
    };

    #[test]
    fn test_jsonl_recorder_writes_line_and_images() {
        let dir = std::env::temp_dir().join(format!("inspect_recorder_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        let recorder = JsonlRecorder::new(&dir).unwrap();

        let frame = Frame::new(Vec2::new(2, 2), PixelFormat::Mono8, vec![1, 2, 3, 4]).unwrap();
        let record = FrameRecord {
            camera: CameraId::from("line:1"),
            sequence: 3,
            frame: FrameRef::Memory(Arc::new(frame)),
            captured_at: SystemTime::now(),
        };
        let result = InferenceResult::classify(&record, record.frame.clone(), vec![], None, 0.0);
        let mut state = SessionState::default();
        state.camera_slots.insert(CameraId::from("line:1"), 1);
        state.good_count = 1;

        let inspection = InspectionRecord::new(&result, &state).unwrap();
        recorder.record(&inspection).unwrap();
        recorder.record(&inspection).unwrap();

        let log = fs::read_to_string(dir.join(JsonlRecorder::LOG_NAME)).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 2);
        let value: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(value["camera"], "line:1");
        assert_eq!(value["slot"], 1);
        assert_eq!(value["score_text"], "OK");
        assert_eq!(value["input_name"], "line_3a1_000003.png");
        assert!(value.get("input").is_none());
        let run = recorder.run();
        assert_eq!(value["input_path"], format!("{run}/line_3a1_000003.png"));
        assert!(dir.join(run).join("line_3a1_000003.png").exists());
        assert!(dir.join(run).join("line_3a1_000003_overlay.png").exists());

        let _ = fs::remove_dir_all(&dir);
    }

    fn inspection(width: usize, height: usize) -> InspectionRecord {
        let frame = Frame::new(
            Vec2::new(width, height),
            PixelFormat::Mono8,
            vec![50; width * height],
        )
        .unwrap();
        let record = FrameRecord {
            camera: CameraId::from("a"),
            sequence: 0,
            frame: FrameRef::Memory(Arc::new(frame)),
            captured_at: SystemTime::now(),
        };
        let result = InferenceResult::classify(&record, record.frame.clone(), vec![], None, 0.0);
        InspectionRecord::new(&result, &SessionState::default()).unwrap()
    }

    #[test]
    fn test_second_session_keeps_first_session_images() {
        let dir = std::env::temp_dir().join(format!("inspect_recorder_twice_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);

        JsonlRecorder::new(&dir).unwrap().record(&inspection(4, 4)).unwrap();
        JsonlRecorder::new(&dir).unwrap().record(&inspection(2, 2)).unwrap();

        let log = fs::read_to_string(dir.join(JsonlRecorder::LOG_NAME)).unwrap();
        let sizes: Vec<Vec2<usize>> = log
            .lines()
            .map(|line| {
                let value: serde_json::Value = serde_json::from_str(line).unwrap();
                let path = dir.join(value["input_path"].as_str().unwrap());
                FrameRef::File(path).load().unwrap().size
            })
            .collect();
        assert_eq!(sizes, vec![Vec2::new(4, 4), Vec2::new(2, 2)]);

        let _ = fs::remove_dir_all(&dir);
    }
}
