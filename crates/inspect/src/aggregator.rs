//! Session State Aggregator.
//!
//! The only place session counters change. Owned by a single task; everyone else reads
//! `snapshot()` copies.

use {
    crate::InferenceResult,
    camera::{CameraId, FrameRecord, FrameRef},
    std::{collections::HashMap, sync::Arc},
};

#[derive(Debug, Clone, Default)]
pub struct SessionState {
    /// Display slot per camera, in the order the cameras were configured.
    pub camera_slots: HashMap<CameraId, usize>,
    pub good_count: u64,
    pub bad_count: u64,
    pub cycle_count: u64,
    pub last_result_by_camera: HashMap<CameraId, Arc<InferenceResult>>,
    pub last_frame_by_camera: HashMap<CameraId, FrameRef>,
}

impl SessionState {
    pub fn results_delivered(&self) -> u64 {
        self.good_count + self.bad_count
    }

    pub fn slot(&self, camera: &CameraId) -> Option<usize> {
        self.camera_slots.get(camera).copied()
    }
}

#[derive(Debug, Default)]
pub struct Aggregator {
    state: SessionState,
    slots_built: bool,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign slot `i` to `cameras[i]`. Only the first call has any effect.
    pub fn build_slot_map(&mut self, cameras: &[CameraId]) {
        if self.slots_built {
            log::warn!("aggregator: slot map already built, ignoring");
            return;
        }
        self.state.camera_slots = cameras
            .iter()
            .enumerate()
            .map(|(slot, camera)| (camera.clone(), slot))
            .collect();
        self.slots_built = true;
    }

    pub fn slot(&self, camera: &CameraId) -> Option<usize> {
        self.state.slot(camera)
    }

    pub fn on_frame_captured(&mut self, frame: &FrameRecord) {
        self.state
            .last_frame_by_camera
            .insert(frame.camera.clone(), frame.frame.clone());
    }

    pub fn on_inference_result(&mut self, result: Arc<InferenceResult>) {
        if result.is_defect {
            self.state.bad_count += 1;
        } else {
            self.state.good_count += 1;
        }
        self.state
            .last_result_by_camera
            .insert(result.camera.clone(), result);
    }

    pub fn on_cycle_complete(&mut self) {
        self.state.cycle_count += 1;
    }

    pub fn snapshot(&self) -> SessionState {
        self.state.clone()
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{Detection, InferError},
        base::{Rect, Vec2},
        std::{path::PathBuf, time::SystemTime},
    };

    fn record(camera: &str, sequence: u64) -> FrameRecord {
        FrameRecord {
            camera: CameraId::from(camera),
            sequence,
            frame: FrameRef::File(PathBuf::from(format!("{camera}_{sequence}.png"))),
            captured_at: SystemTime::UNIX_EPOCH,
        }
    }

    fn result(camera: &str, sequence: u64, defect: bool) -> Arc<InferenceResult> {
        let frame = record(camera, sequence);
        let detections = if defect {
            vec![Detection {
                class_name: "dent".to_string(),
                confidence: 0.8,
                bbox: Rect::new(Vec2::new(0, 0), Vec2::new(2, 2)),
            }]
        } else {
            vec![]
        };
        Arc::new(InferenceResult::classify(&frame, frame.frame.clone(), detections, None, 0.5))
    }

    #[test]
    fn test_slot_map_follows_order_and_is_fixed() {
        let mut aggregator = Aggregator::new();
        aggregator.build_slot_map(&[CameraId::from("b"), CameraId::from("a")]);
        aggregator.build_slot_map(&[CameraId::from("a")]);
        assert_eq!(aggregator.slot(&CameraId::from("b")), Some(0));
        assert_eq!(aggregator.slot(&CameraId::from("a")), Some(1));
        assert_eq!(aggregator.snapshot().camera_slots.len(), 2);
    }

    #[test]
    fn test_counts_match_delivered_results() {
        let mut aggregator = Aggregator::new();
        aggregator.build_slot_map(&[CameraId::from("a"), CameraId::from("b")]);
        let verdicts = [false, true, false, false, true, false, false];
        for (sequence, defect) in verdicts.iter().enumerate() {
            let camera = if sequence % 2 == 0 { "a" } else { "b" };
            aggregator.on_inference_result(result(camera, sequence as u64, *defect));
        }
        let state = aggregator.snapshot();
        assert_eq!(state.good_count, 5);
        assert_eq!(state.bad_count, 2);
        assert_eq!(state.results_delivered(), verdicts.len() as u64);
        assert_eq!(state.last_result_by_camera[&CameraId::from("a")].sequence, 6);
        assert_eq!(state.last_result_by_camera[&CameraId::from("b")].sequence, 5);
    }

    #[test]
    fn test_fail_open_counts_as_good() {
        let mut aggregator = Aggregator::new();
        let frame = record("a", 0);
        aggregator.on_inference_result(Arc::new(InferenceResult::fail_open(
            &frame,
            InferError::Runtime("down".to_string()),
        )));
        assert_eq!(aggregator.snapshot().good_count, 1);
    }

    #[test]
    fn test_frames_do_not_touch_counters() {
        let mut aggregator = Aggregator::new();
        aggregator.on_frame_captured(&record("a", 0));
        aggregator.on_frame_captured(&record("a", 1));
        let state = aggregator.snapshot();
        assert_eq!(state.results_delivered(), 0);
        assert_eq!(
            state.last_frame_by_camera[&CameraId::from("a")],
            FrameRef::File(PathBuf::from("a_1.png"))
        );
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let mut aggregator = Aggregator::new();
        let before = aggregator.snapshot();
        aggregator.on_cycle_complete();
        aggregator.on_cycle_complete();
        assert_eq!(before.cycle_count, 0);
        assert_eq!(aggregator.snapshot().cycle_count, 2);
    }
}
