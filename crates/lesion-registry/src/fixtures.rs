//! 测试用的数据构造与替身实现

use chrono::{Duration, NaiveDate};
use lesion_core::{CategorySnapshot, Finding, RegistryObserver, Timepoint, TimepointType, ToolState, ToolStateBridge};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub const PATIENT_ID: &str = "patient-1";

pub fn day(offset: i64) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + Duration::days(offset)
}

/// 检查UID为 `study-<id>` 的时间点
pub fn timepoint(id: &str, timepoint_type: TimepointType, offset: i64) -> Timepoint {
    Timepoint::new(id, timepoint_type, day(offset), PATIENT_ID).with_study(study_uid(id))
}

pub fn study_uid(timepoint_id: &str) -> String {
    format!("study-{}", timepoint_id)
}

/// 位于指定时间点检查中的测量
pub fn finding_at(finding_type: &str, timepoint_id: &str, image_id: &str) -> Finding {
    let mut finding = Finding::new(finding_type);
    finding.study_instance_uid = Some(study_uid(timepoint_id));
    finding.image_id = Some(image_id.to_string());
    finding
}

#[derive(Default)]
pub struct RecordingObserver {
    timepoint_updates: AtomicUsize,
    measurement_updates: AtomicUsize,
}

impl RecordingObserver {
    pub fn timepoint_updates(&self) -> usize {
        self.timepoint_updates.load(Ordering::SeqCst)
    }

    pub fn measurement_updates(&self) -> usize {
        self.measurement_updates.load(Ordering::SeqCst)
    }
}

impl RegistryObserver for RecordingObserver {
    fn on_timepoints_updated(&self, _timepoints: &[Timepoint]) {
        self.timepoint_updates.fetch_add(1, Ordering::SeqCst);
    }

    fn on_measurements_updated(&self, _snapshot: &CategorySnapshot) {
        self.measurement_updates.fetch_add(1, Ordering::SeqCst);
    }
}

/// 记录读写次数的工具状态
#[derive(Default)]
pub struct MemoryBridge {
    state: Mutex<ToolState>,
    restores: AtomicUsize,
}

impl MemoryBridge {
    pub fn state(&self) -> ToolState {
        self.state.lock().unwrap().clone()
    }

    pub fn restores(&self) -> usize {
        self.restores.load(Ordering::SeqCst)
    }

    pub fn entries(&self, image_id: &str, finding_type: &str) -> Vec<Finding> {
        self.state()
            .get(image_id)
            .and_then(|per_image| per_image.get(finding_type))
            .cloned()
            .unwrap_or_default()
    }
}

impl ToolStateBridge for MemoryBridge {
    fn save_state(&self) -> ToolState {
        self.state()
    }

    fn restore_state(&self, state: ToolState) {
        *self.state.lock().unwrap() = state;
        self.restores.fetch_add(1, Ordering::SeqCst);
    }
}
