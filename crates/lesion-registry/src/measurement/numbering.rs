//! 病灶命名编号与测量编号

use super::MeasurementRegistry;
use crate::timepoint::TimepointRegistry;
use lesion_core::{Finding, IndexRow, NON_TARGETS_CATEGORY_ID, TARGETS_CATEGORY_ID};
use tracing::debug;

/// 计算最小的未使用编号（从1开始）
pub fn calculate_lesion_naming_number(used: impl IntoIterator<Item = u32>) -> u32 {
    let mut sorted: Vec<u32> = used.into_iter().filter(|n| *n > 0).collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut candidate = 1;
    for number in sorted {
        if candidate < number {
            break;
        }
        candidate += 1;
    }
    candidate
}

impl MeasurementRegistry {
    /// 病灶在任一给定时间点上是否已有测量（含占位行）
    pub fn lesion_exists_at_timepoints(
        &self,
        lesion_naming_number: u32,
        category_id: &str,
        timepoint_ids: &[String],
    ) -> bool {
        self.fetch(category_id, |row| timepoint_ids.contains(&row.timepoint_id))
            .map(|found| found.iter().any(|f| f.lesion_naming_number() == lesion_naming_number))
            .unwrap_or(false)
    }

    /// 测量是否为新病灶：在所有初始时间点上都不存在同编号病灶
    pub fn is_new_lesion_measurement(&self, timepoints: &TimepointRegistry, finding: &Finding) -> bool {
        let initial_ids = timepoints.initial_timepoint_ids();
        self.is_new_finding(&initial_ids, finding)
    }

    pub(super) fn is_new_finding(&self, initial_ids: &[String], finding: &Finding) -> bool {
        let Some(category_id) = self.finding_type_map.get(&finding.finding_type) else {
            return false;
        };

        // 已登记的测量以登记时的数据为准
        let stored = self
            .findings(&finding.finding_type)
            .iter()
            .find(|f| f.id == finding.id);
        let timepoint_id = stored
            .and_then(|f| f.timepoint_id.as_deref())
            .or(finding.timepoint_id.as_deref());
        let lesion_naming_number = stored
            .map(|f| f.lesion_naming_number)
            .filter(|n| *n > 0)
            .unwrap_or(finding.lesion_naming_number);

        self.is_new_lesion(initial_ids, category_id, timepoint_id, lesion_naming_number)
    }

    fn is_new_lesion(
        &self,
        initial_ids: &[String],
        category_id: &str,
        timepoint_id: Option<&str>,
        lesion_naming_number: u32,
    ) -> bool {
        let Some(timepoint_id) = timepoint_id else {
            return false;
        };
        if initial_ids.is_empty() || initial_ids.iter().any(|id| id == timepoint_id) {
            return false;
        }

        !self.lesion_exists_at_timepoints(lesion_naming_number, category_id, initial_ids)
    }

    fn is_new_row(&self, initial_ids: &[String], category_id: &str, row: &IndexRow) -> bool {
        match self.backing_finding(row) {
            Some(finding) => self.is_new_lesion(
                initial_ids,
                category_id,
                finding.timepoint_id.as_deref(),
                finding.lesion_naming_number,
            ),
            None => self.is_new_lesion(
                initial_ids,
                category_id,
                Some(row.timepoint_id.as_str()),
                row.lesion_naming_number,
            ),
        }
    }

    /// 指定分类（None 表示全部分类）中新旧病灶的最大测量编号
    fn max_measurement_number(
        &self,
        initial_ids: &[String],
        category_id: Option<&str>,
        exclude_id: &str,
        new_lesions: bool,
    ) -> u32 {
        let mut rows: Vec<(&str, &IndexRow)> = self
            .index
            .iter()
            .filter(|(id, _)| category_id.map_or(true, |c| c == id.as_str()))
            .flat_map(|(id, rows)| rows.iter().map(move |row| (id.as_str(), row)))
            .filter(|(_, row)| row.finding_id.as_deref() != Some(exclude_id))
            .collect();
        rows.sort_by(|a, b| b.1.measurement_number.cmp(&a.1.measurement_number));

        rows.into_iter()
            .find(|(category, row)| self.is_new_row(initial_ids, category, row) == new_lesions)
            .map(|(_, row)| {
                self.backing_finding(row)
                    .map_or(row.measurement_number, |f| f.measurement_number)
            })
            .unwrap_or(0)
    }

    /// 计算测量编号的基数（调用方在此基础上加1）
    ///
    /// 新病灶排在所有已有病灶与新靶病灶之后；只有非靶病灶的新病灶会把已有的
    /// 新非靶病灶计入最大值。其他分类的新病灶返回0。
    pub fn calculate_measurement_number(&self, timepoints: &TimepointRegistry, finding: &Finding) -> u32 {
        let initial_ids = timepoints.initial_timepoint_ids();
        let category_id = self.finding_type_map.get(&finding.finding_type).map(String::as_str);
        let is_new = self.is_new_finding(&initial_ids, finding);
        let max = |category: Option<&str>, new_lesions: bool| {
            self.max_measurement_number(&initial_ids, category, &finding.id, new_lesions)
        };

        let number = if is_new {
            let max_target = max(Some(TARGETS_CATEGORY_ID), false);
            let max_non_target = max(Some(NON_TARGETS_CATEGORY_ID), false);
            let max_new_target = max(Some(TARGETS_CATEGORY_ID), true);

            match category_id {
                Some(TARGETS_CATEGORY_ID) => max_target.max(max_non_target).max(max_new_target),
                Some(NON_TARGETS_CATEGORY_ID) => {
                    let max_new_non_target = max(Some(NON_TARGETS_CATEGORY_ID), true);
                    max_target
                        .max(max_non_target)
                        .max(max_new_target)
                        .max(max_new_non_target)
                }
                _ => 0,
            }
        } else {
            match category_id {
                Some(TARGETS_CATEGORY_ID) => max(Some(TARGETS_CATEGORY_ID), false),
                Some(NON_TARGETS_CATEGORY_ID) => {
                    max(Some(TARGETS_CATEGORY_ID), false).max(max(Some(NON_TARGETS_CATEGORY_ID), false))
                }
                _ => max(None, false),
            }
        };

        debug!(finding_id = %finding.id, is_new, number, "Measurement number base calculated");
        number
    }

    /// 将非临时分类中编号不小于 `from` 的测量整体平移 `delta`（不含 `exclude_id`）
    pub(super) fn shift_measurement_numbers(&mut self, exclude_id: &str, from: u32, delta: i64) {
        let shift = |number: u32| -> u32 { (i64::from(number) + delta).max(0) as u32 };
        let tracked: Vec<(String, Vec<String>)> = self
            .tracked_categories()
            .map(|c| (c.id.clone(), c.child_finding_types.clone()))
            .collect();

        for (category_id, finding_types) in tracked {
            if let Some(rows) = self.index.get_mut(&category_id) {
                for row in rows
                    .iter_mut()
                    .filter(|r| r.finding_id.as_deref() != Some(exclude_id) && r.measurement_number >= from)
                {
                    row.measurement_number = shift(row.measurement_number);
                }
            }

            for finding_type in finding_types {
                if let Some(findings) = self.collections.get_mut(&finding_type) {
                    for finding in findings
                        .iter_mut()
                        .filter(|f| f.id != exclude_id && f.measurement_number >= from)
                    {
                        let lesion_naming_number = finding.lesion_naming_number;
                        finding.set_numbers(lesion_naming_number, shift(finding.measurement_number));
                    }
                }
            }
        }

        debug!(from, delta, "Measurement numbers shifted");
    }

    /// 将分类内编号不小于 `from` 的病灶命名编号平移 `delta`
    pub(super) fn shift_lesion_naming_numbers(&mut self, category_id: &str, from: u32, delta: i64) {
        let shift = |number: u32| -> u32 { (i64::from(number) + delta).max(0) as u32 };
        let finding_types = self
            .config
            .category(category_id)
            .map(|c| c.child_finding_types.clone())
            .unwrap_or_default();

        if let Some(rows) = self.index.get_mut(category_id) {
            for row in rows.iter_mut().filter(|r| r.lesion_naming_number >= from) {
                row.lesion_naming_number = shift(row.lesion_naming_number);
            }
        }

        for finding_type in finding_types {
            if let Some(findings) = self.collections.get_mut(&finding_type) {
                for finding in findings.iter_mut().filter(|f| f.lesion_naming_number >= from) {
                    let measurement_number = finding.measurement_number;
                    finding.set_numbers(shift(finding.lesion_naming_number), measurement_number);
                }
            }
        }
    }

    /// 非临时分类中是否仍有测量使用该测量编号
    pub(super) fn measurement_number_in_use(&self, number: u32) -> bool {
        self.tracked_categories().any(|category| {
            self.index
                .get(&category.id)
                .is_some_and(|rows| rows.iter().any(|r| r.measurement_number == number))
        })
    }
}
