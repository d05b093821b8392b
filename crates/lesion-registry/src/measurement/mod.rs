//! 测量注册表
//!
//! 按分类维护测量集合与轻量索引，负责：
//! - 病灶命名编号与测量编号的分配、插入/删除时的级联调整
//! - 跨时间点的同一病灶匹配
//! - 与外部工具状态的同步

mod matching;
mod numbering;
mod removal;
mod sync;

pub use matching::MatchStrategy;
pub use numbering::calculate_lesion_naming_number;

use crate::timepoint::TimepointRegistry;
use lesion_core::utils::generate_finding_id;
use lesion_core::{
    CategoryConfig, CategorySnapshot, FetchedFinding, Finding, IndexRow, MeasurementConfiguration, MeasurementData,
    RegistryObserver, Result, ToolStateBridge, TrackerError,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 测量注册表
pub struct MeasurementRegistry {
    config: MeasurementConfiguration,
    /// 测量类型 -> 分类ID
    finding_type_map: HashMap<String, String>,
    /// 分类ID -> 索引行
    index: BTreeMap<String, Vec<IndexRow>>,
    /// 测量类型 -> 测量
    collections: BTreeMap<String, Vec<Finding>>,
    bridge: Option<Arc<dyn ToolStateBridge>>,
    observer: Option<Arc<dyn RegistryObserver>>,
}

impl MeasurementRegistry {
    /// 创建新的测量注册表
    pub fn new(config: MeasurementConfiguration) -> Self {
        let mut registry = Self {
            config: MeasurementConfiguration { categories: Vec::new() },
            finding_type_map: HashMap::new(),
            index: BTreeMap::new(),
            collections: BTreeMap::new(),
            bridge: None,
            observer: None,
        };
        registry.set_configuration(config);
        registry
    }

    pub fn with_tool_state_bridge(mut self, bridge: Arc<dyn ToolStateBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RegistryObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn set_tool_state_bridge(&mut self, bridge: Option<Arc<dyn ToolStateBridge>>) {
        self.bridge = bridge;
    }

    pub fn set_observer(&mut self, observer: Option<Arc<dyn RegistryObserver>>) {
        self.observer = observer;
    }

    /// 设置分类配置并重建空集合
    pub fn set_configuration(&mut self, config: MeasurementConfiguration) {
        self.finding_type_map = config.finding_type_map();
        self.index.clear();
        self.collections.clear();

        for category in &config.categories {
            self.index.insert(category.id.clone(), Vec::new());
            for finding_type in &category.child_finding_types {
                self.collections.insert(finding_type.clone(), Vec::new());
            }
        }

        info!(
            categories = config.categories.len(),
            finding_types = self.finding_type_map.len(),
            "Measurement configuration applied"
        );
        self.config = config;
    }

    pub fn configuration(&self) -> &MeasurementConfiguration {
        &self.config
    }

    /// 清空所有测量，保留配置
    pub fn reset(&mut self) {
        self.index.values_mut().for_each(Vec::clear);
        self.collections.values_mut().for_each(Vec::clear);
    }

    /// 测量类型所属的分类ID
    pub fn category_id_of(&self, finding_type: &str) -> Result<&str> {
        self.finding_type_map
            .get(finding_type)
            .map(String::as_str)
            .ok_or_else(|| TrackerError::UnknownFindingType(finding_type.to_string()))
    }

    /// 测量类型所属的分类配置
    pub fn tool_configuration(&self, finding_type: &str) -> Option<&CategoryConfig> {
        let category_id = self.finding_type_map.get(finding_type)?;
        self.config.category(category_id)
    }

    pub fn index_rows(&self, category_id: &str) -> Result<&[IndexRow]> {
        self.index
            .get(category_id)
            .map(Vec::as_slice)
            .ok_or_else(|| TrackerError::UnknownCategory(category_id.to_string()))
    }

    fn rows_mut(&mut self, category_id: &str) -> Result<&mut Vec<IndexRow>> {
        self.index
            .get_mut(category_id)
            .ok_or_else(|| TrackerError::UnknownCategory(category_id.to_string()))
    }

    /// 某测量类型下的全部测量
    pub fn findings(&self, finding_type: &str) -> &[Finding] {
        self.collections.get(finding_type).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn find_finding(&self, finding_id: &str) -> Option<&Finding> {
        self.collections.values().flatten().find(|f| f.id == finding_id)
    }

    fn backing_finding(&self, row: &IndexRow) -> Option<&Finding> {
        let finding_type = row.finding_type.as_deref()?;
        let finding_id = row.finding_id.as_deref()?;
        self.findings(finding_type).iter().find(|f| f.id == finding_id)
    }

    /// 参与病例进度的分类
    fn case_progress_categories(&self) -> impl Iterator<Item = &CategoryConfig> {
        self.config.categories.iter().filter(|c| c.include_in_case_progress)
    }

    /// 非临时分类
    fn tracked_categories(&self) -> impl Iterator<Item = &CategoryConfig> {
        self.config.categories.iter().filter(|c| !c.is_temp())
    }

    /// 按测量类型分组的快照
    pub fn snapshot(&self) -> CategorySnapshot {
        self.collections.clone()
    }

    fn notify_updated(&self) {
        match &self.observer {
            Some(observer) => observer.on_measurements_updated(&self.snapshot()),
            None => warn!("Measurements update callback is not defined"),
        }
    }

    /// 渲染层在测量数据生成前登记的占位行
    pub fn insert_placeholder(
        &mut self,
        category_id: &str,
        timepoint_id: &str,
        lesion_naming_number: u32,
        measurement_number: u32,
    ) -> Result<()> {
        let rows = self.rows_mut(category_id)?;
        rows.push(IndexRow::placeholder(timepoint_id, lesion_naming_number, measurement_number));
        debug!(category_id, timepoint_id, lesion_naming_number, "Placeholder row inserted");
        Ok(())
    }

    /// 添加测量
    ///
    /// 无法解析所属时间点的测量（独立打开的检查）不纳入目录，返回 `Ok(None)`。
    pub fn add_measurement(
        &mut self,
        timepoints: &TimepointRegistry,
        finding_type: &str,
        mut finding: Finding,
    ) -> Result<Option<Finding>> {
        let category_id = self.category_id_of(finding_type)?.to_string();
        finding.finding_type = finding_type.to_string();

        // 同一病灶编号的测量共享位置与描述
        if finding.lesion_naming_number > 0 {
            if let Some(related) = self
                .findings(finding_type)
                .iter()
                .find(|f| f.lesion_naming_number == finding.lesion_naming_number)
            {
                if related.location.is_some() {
                    finding.location = related.location.clone();
                }
                if related.description.is_some() {
                    finding.description = related.description.clone();
                }
            }
        }

        if finding.id.is_empty() {
            finding.id = generate_finding_id();
        }

        let timepoint = match finding.study_instance_uid.as_deref() {
            Some(uid) => timepoints.study(uid).into_iter().next(),
            None => finding.timepoint_id.as_deref().and_then(|id| timepoints.find(id)),
        };
        let Some(timepoint) = timepoint else {
            debug!(finding_id = %finding.id, "No timepoint resolved for finding, treating as standalone");
            return Ok(None);
        };
        let timepoint_id = timepoint.timepoint_id.clone();
        finding.timepoint_id = Some(timepoint_id.clone());

        let adopted = self.adopt_placeholder(&category_id, &timepoint_id, &mut finding)?;
        if !adopted {
            let lesion_naming_number = {
                let rows = self.index_rows(&category_id)?;
                calculate_lesion_naming_number(
                    rows.iter()
                        .filter(|r| r.timepoint_id == timepoint_id && r.finding_id.as_deref() != Some(finding.id.as_str()))
                        .map(|r| r.lesion_naming_number),
                )
            };
            finding.lesion_naming_number = lesion_naming_number;

            let measurement_number = if finding.measurement_number > 0 {
                finding.measurement_number
            } else {
                self.calculate_measurement_number(timepoints, &finding) + 1
            };
            finding.set_numbers(lesion_naming_number, measurement_number);
        }

        match self.previous_measurement(&finding).cloned() {
            Some(found) => {
                debug!(finding_id = %finding.id, matched = %found.id, "Finding matched at another timepoint");
                inherit_from_match(&mut finding, &found);
            }
            None => {
                if self.has_duplicate_measurement_number(&finding) {
                    self.shift_measurement_numbers(&finding.id, finding.measurement_number, 1);
                }
            }
        }

        let collection = self.collections.entry(finding_type.to_string()).or_default();
        match collection.iter().position(|f| f.id == finding.id) {
            Some(index) => collection[index] = finding.clone(),
            None => collection.push(finding.clone()),
        }

        self.refresh_index_rows(&category_id, &finding)?;

        info!(
            finding_id = %finding.id,
            category_id = %category_id,
            timepoint_id = %timepoint_id,
            lesion_naming_number = finding.lesion_naming_number,
            measurement_number = finding.measurement_number,
            "Measurement added"
        );

        if self
            .config
            .category(&category_id)
            .is_some_and(|c| c.include_in_case_progress)
        {
            self.sync_measurement_and_tool_data(&finding);
        }
        self.notify_updated();

        Ok(Some(finding))
    }

    /// 如果该时间点存在占位行，则沿用其编号并让同编号的占位行指向该测量
    fn adopt_placeholder(&mut self, category_id: &str, timepoint_id: &str, finding: &mut Finding) -> Result<bool> {
        let rows = self.rows_mut(category_id)?;
        let Some(placeholder) = rows
            .iter()
            .find(|r| r.is_placeholder() && r.timepoint_id == timepoint_id)
        else {
            return Ok(false);
        };

        let lesion_naming_number = placeholder.lesion_naming_number;
        let measurement_number = placeholder.measurement_number;
        finding.set_numbers(lesion_naming_number, measurement_number);

        for row in rows
            .iter_mut()
            .filter(|r| r.timepoint_id == timepoint_id && r.lesion_naming_number == lesion_naming_number)
        {
            row.finding_type = Some(finding.finding_type.clone());
            row.finding_id = Some(finding.id.clone());
            row.created_at = Some(finding.created_at);
            row.measurement_number = measurement_number;
        }

        debug!(finding_id = %finding.id, lesion_naming_number, "Placeholder adopted");
        Ok(true)
    }

    /// 更新（或追加）指向该测量的索引行
    fn refresh_index_rows(&mut self, category_id: &str, finding: &Finding) -> Result<()> {
        let timepoint_id = finding.timepoint_id.clone().unwrap_or_default();
        let rows = self.rows_mut(category_id)?;

        let mut refreshed = false;
        for row in rows
            .iter_mut()
            .filter(|r| r.finding_id.as_deref() == Some(finding.id.as_str()))
        {
            row.finding_type = Some(finding.finding_type.clone());
            row.timepoint_id = timepoint_id.clone();
            row.study_instance_uid = finding.study_instance_uid.clone();
            row.lesion_naming_number = finding.lesion_naming_number;
            row.measurement_number = finding.measurement_number;
            row.created_at = Some(finding.created_at);
            refreshed = true;
        }

        if !refreshed {
            rows.push(IndexRow {
                finding_type: Some(finding.finding_type.clone()),
                finding_id: Some(finding.id.clone()),
                timepoint_id,
                study_instance_uid: finding.study_instance_uid.clone(),
                lesion_naming_number: finding.lesion_naming_number,
                measurement_number: finding.measurement_number,
                created_at: Some(finding.created_at),
            });
        }

        Ok(())
    }

    /// 按ID原位替换测量，不触发重新编号
    pub fn update_measurement(&mut self, finding_type: &str, finding: Finding) -> Result<bool> {
        self.category_id_of(finding_type)?;

        let collection = self.collections.entry(finding_type.to_string()).or_default();
        let Some(index) = collection.iter().position(|f| f.id == finding.id) else {
            debug!(finding_id = %finding.id, "Update skipped, finding not registered");
            return Ok(false);
        };
        collection[index] = finding;

        self.notify_updated();
        Ok(true)
    }

    /// 将分类索引行解析为测量（没有对应测量的行返回占位）
    pub fn fetch<F>(&self, category_id: &str, filter: F) -> Result<Vec<FetchedFinding>>
    where
        F: Fn(&IndexRow) -> bool,
    {
        let rows = self.index_rows(category_id)?;
        Ok(rows
            .iter()
            .filter(|row| filter(row))
            .map(|row| match self.backing_finding(row) {
                Some(finding) => FetchedFinding::Recorded(finding.clone()),
                None => FetchedFinding::Placeholder {
                    lesion_naming_number: row.lesion_naming_number,
                },
            })
            .collect())
    }

    pub fn fetch_all(&self, category_id: &str) -> Result<Vec<FetchedFinding>> {
        self.fetch(category_id, |_| true)
    }

    /// 非临时分类中是否存在其他测量使用相同的测量编号
    pub fn has_duplicate_measurement_number(&self, finding: &Finding) -> bool {
        if finding.measurement_number == 0 {
            return false;
        }

        let number = finding.measurement_number;
        let id = finding.id.as_str();
        self.tracked_categories().any(|category| {
            let in_index = self.index.get(&category.id).is_some_and(|rows| {
                rows.iter()
                    .any(|r| r.finding_id.as_deref() != Some(id) && r.measurement_number == number)
            });
            in_index
                || category.child_finding_types.iter().any(|finding_type| {
                    self.findings(finding_type)
                        .iter()
                        .any(|f| f.id != id && f.measurement_number == number)
                })
        })
    }

    /// 指定时间点上编号为1的测量
    pub fn first_measurement(&self, timepoint_id: &str) -> Option<&Finding> {
        self.case_progress_categories()
            .flat_map(|category| category.child_finding_types.iter())
            .flat_map(|finding_type| self.findings(finding_type).iter())
            .find(|f| f.timepoint_id.as_deref() == Some(timepoint_id) && f.measurement_number == 1)
    }

    /// 需要持久化的测量，按分类ID分组
    pub fn measurement_data_for_storage(&self) -> MeasurementData {
        let mut data = MeasurementData::new();
        for category in self.case_progress_categories() {
            let findings = data.entry(category.id.clone()).or_default();
            for finding_type in &category.child_finding_types {
                findings.extend(self.findings(finding_type).iter().cloned());
            }
        }
        data
    }
}

/// 继承匹配测量的编号与临床信息
fn inherit_from_match(finding: &mut Finding, found: &Finding) {
    finding.set_numbers(found.lesion_naming_number, found.measurement_number);

    let mut additional_data = found.additional_data.clone();
    for (key, value) in std::mem::take(&mut finding.additional_data.extra) {
        additional_data.extra.entry(key).or_insert(value);
    }
    finding.additional_data = additional_data;

    finding.location = found.location.clone();
    finding.label = found.label.clone();
    if found.description.is_some() {
        finding.description = found.description.clone();
    }
    finding.is_split_lesion = found.is_split_lesion;
    finding.is_nodal = found.is_nodal;
}
