//! 测量与工具状态的同步

use super::MeasurementRegistry;
use lesion_core::utils::lesion_label;
use lesion_core::{Finding, FindingShape, ToolState};
use tracing::debug;

impl MeasurementRegistry {
    /// 将所有参与病例进度的测量写入工具状态
    ///
    /// 同一状态只读取、写回各一次；重复调用得到相同的状态。
    pub fn sync_measurements_and_tool_data(&self) {
        let Some(bridge) = &self.bridge else {
            debug!("Tool state bridge is not configured, skipping sync");
            return;
        };

        let mut state = bridge.save_state();
        let mut synced = 0usize;
        for category in self.case_progress_categories() {
            for finding_type in &category.child_finding_types {
                for finding in self.findings(finding_type) {
                    self.mirror_finding(&mut state, finding);
                    synced += 1;
                }
            }
        }
        bridge.restore_state(state);

        debug!(synced, "Measurements synced to tool state");
    }

    /// 将单条测量写入工具状态
    pub fn sync_measurement_and_tool_data(&self, finding: &Finding) {
        self.sync_findings(std::iter::once(finding));
    }

    pub(super) fn sync_findings<'a>(&self, findings: impl IntoIterator<Item = &'a Finding>) {
        let Some(bridge) = &self.bridge else {
            return;
        };

        let mut state = bridge.save_state();
        for finding in findings {
            self.mirror_finding(&mut state, finding);
        }
        bridge.restore_state(state);
    }

    /// 从工具状态中移除该测量的全部条目
    pub(super) fn remove_tool_data(&self, finding: &Finding) {
        let Some(bridge) = &self.bridge else {
            return;
        };

        let mut state = bridge.save_state();
        for per_image in state.values_mut() {
            for entries in per_image.values_mut() {
                entries.retain(|entry| entry.id != finding.id);
            }
            per_image.retain(|_, entries| !entries.is_empty());
        }
        state.retain(|_, per_image| !per_image.is_empty());
        bridge.restore_state(state);
    }

    fn mirror_finding(&self, state: &mut ToolState, finding: &Finding) {
        let category_name = self
            .tool_configuration(&finding.finding_type)
            .and_then(|c| c.name.as_deref());
        let mut entry = finding.clone();
        if let Some(label) = lesion_label(category_name, finding.lesion_naming_number) {
            entry.label = Some(label);
        }
        mirror_entry(state, entry);
    }
}

/// 组合测量按子测量拆分写入，子测量沿用父测量的ID、编号与标签
fn mirror_entry(state: &mut ToolState, entry: Finding) {
    match &entry.shape {
        FindingShape::Composite(parts) => {
            for part in parts {
                let mut child = part.clone();
                child.id = entry.id.clone();
                child.set_numbers(entry.lesion_naming_number, entry.measurement_number);
                child.label = entry.label.clone();
                if child.timepoint_id.is_none() {
                    child.timepoint_id = entry.timepoint_id.clone();
                }
                if child.image_id.is_none() {
                    child.image_id = entry.image_id.clone();
                }
                mirror_entry(state, child);
            }
        }
        FindingShape::Simple => {
            let Some(image_id) = entry.image_id.clone() else {
                debug!(finding_id = %entry.id, "Finding has no image id, not mirrored");
                return;
            };
            let entries = state
                .entry(image_id)
                .or_default()
                .entry(entry.finding_type.clone())
                .or_default();
            match entries.iter().position(|e| e.id == entry.id) {
                Some(index) => entries[index] = entry,
                None => entries.push(entry),
            }
        }
    }
}
