//! 内存工具状态

use lesion_core::{Finding, ToolState, ToolStateBridge};
use std::sync::{Mutex, MutexGuard};

/// 进程内的工具状态，供没有渲染层的调用方使用
#[derive(Debug, Default)]
pub struct InMemoryToolState {
    state: Mutex<ToolState>,
}

impl InMemoryToolState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ToolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 某影像上某测量类型的标注条目
    pub fn entries(&self, image_id: &str, finding_type: &str) -> Vec<Finding> {
        self.lock()
            .get(image_id)
            .and_then(|per_image| per_image.get(finding_type))
            .cloned()
            .unwrap_or_default()
    }

    /// 标注条目总数
    pub fn entry_count(&self) -> usize {
        self.lock()
            .values()
            .flat_map(|per_image| per_image.values())
            .map(Vec::len)
            .sum()
    }
}

impl ToolStateBridge for InMemoryToolState {
    fn save_state(&self) -> ToolState {
        self.lock().clone()
    }

    fn restore_state(&self, state: ToolState) {
        *self.lock() = state;
    }
}
