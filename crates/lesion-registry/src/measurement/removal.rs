//! 测量删除与编号回收

use super::MeasurementRegistry;
use lesion_core::{Finding, FindingFilter, Result};
use std::collections::BTreeSet;
use tracing::{debug, info};

impl MeasurementRegistry {
    /// 删除单条测量
    ///
    /// 当该病灶在任何时间点上都不再有测量时，回收其病灶命名编号（仅限本分类）
    /// 与测量编号（所有非临时分类），使编号保持连续。
    pub fn on_measurement_removed(&mut self, finding_type: &str, finding: &Finding) -> Result<()> {
        let category_id = self.category_id_of(finding_type)?.to_string();
        let rows = self.rows_mut(&category_id)?;

        let Some(removed) = rows
            .iter()
            .find(|r| r.finding_id.as_deref() == Some(finding.id.as_str()))
            .cloned()
        else {
            debug!(finding_id = %finding.id, "Removed finding has no index row");
            return Ok(());
        };
        rows.retain(|r| r.finding_id.as_deref() != Some(finding.id.as_str()));
        let lesion_still_tracked = rows
            .iter()
            .any(|r| r.lesion_naming_number == removed.lesion_naming_number);

        if let Some(findings) = self.collections.get_mut(finding_type) {
            findings.retain(|f| f.id != finding.id);
        }
        self.remove_tool_data(finding);

        if !lesion_still_tracked {
            self.shift_lesion_naming_numbers(&category_id, removed.lesion_naming_number, -1);

            let is_temp = self
                .config
                .category(&category_id)
                .is_some_and(|c| c.is_temp());
            if !is_temp && !self.measurement_number_in_use(removed.measurement_number) {
                self.shift_measurement_numbers(&finding.id, removed.measurement_number, -1);
            }
        }

        info!(
            finding_id = %finding.id,
            category_id = %category_id,
            lesion_naming_number = removed.lesion_naming_number,
            measurement_number = removed.measurement_number,
            renumbered = !lesion_still_tracked,
            "Measurement removed"
        );

        self.sync_measurements_and_tool_data();
        self.notify_updated();
        Ok(())
    }

    /// 按过滤条件批量删除分类中的测量，返回删除的数量
    pub fn delete_measurements(
        &mut self,
        finding_type: &str,
        category_id: &str,
        filter: &FindingFilter,
    ) -> Result<usize> {
        let entries: Vec<Finding> = {
            let rows = self.index_rows(category_id)?;
            let mut seen = BTreeSet::new();
            rows.iter()
                .filter(|row| filter.matches_row(row))
                .filter_map(|row| self.backing_finding(row))
                .filter(|f| seen.insert(f.id.clone()))
                .cloned()
                .collect()
        };

        let Some(first) = entries.first() else {
            debug!(finding_type, category_id, "No measurements matched for deletion");
            return Ok(0);
        };
        let lesion_naming_number = filter
            .lesion_naming_number
            .unwrap_or(first.lesion_naming_number);

        for entry in &entries {
            self.on_measurement_removed(&entry.finding_type, entry)?;
        }

        // 编号调整后，重新同步受影响的后续病灶
        let affected_types: BTreeSet<&str> = entries.iter().map(|e| e.finding_type.as_str()).collect();
        let sync_filter = filter.without_position();
        let to_sync: Vec<Finding> = affected_types
            .into_iter()
            .flat_map(|t| self.findings(t).iter())
            .filter(|f| f.lesion_naming_number >= lesion_naming_number && sync_filter.matches_finding(f))
            .cloned()
            .collect();
        self.sync_findings(&to_sync);

        info!(finding_type, category_id, removed = entries.len(), "Measurements deleted");
        Ok(entries.len())
    }
}
