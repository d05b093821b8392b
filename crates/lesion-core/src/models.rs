//! 核心数据模型定义

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// 被标记为最低点（nadir）的时间点键值
pub const NADIR_KEY: &str = "nadir";

/// 时间点类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TimepointType {
    Prebaseline, // 基线前
    Baseline,    // 基线
    Followup,    // 随访
}

impl TimepointType {
    /// 用于显示的类型名称
    pub fn display_name(&self) -> &'static str {
        match self {
            TimepointType::Prebaseline => "Pre-Baseline",
            TimepointType::Baseline => "Baseline",
            TimepointType::Followup => "Follow-up",
        }
    }

    /// 是否属于初始评估阶段（基线前或基线）
    pub fn is_initial(&self) -> bool {
        matches!(self, TimepointType::Prebaseline | TimepointType::Baseline)
    }
}

/// 时间点：患者的一次影像检查访视
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Timepoint {
    pub timepoint_id: String,
    pub timepoint_type: TimepointType,
    pub visit_date: NaiveDate,
    pub patient_id: String,
    #[serde(default)]
    pub study_instance_uids: BTreeSet<String>,
    #[serde(default)]
    pub timepoint_key: Option<String>, // 例如 "nadir"
    #[serde(default)]
    pub is_locked: bool,
    #[serde(default)]
    pub visit_number: Option<u32>,
}

impl Timepoint {
    pub fn new(
        timepoint_id: impl Into<String>,
        timepoint_type: TimepointType,
        visit_date: NaiveDate,
        patient_id: impl Into<String>,
    ) -> Self {
        Self {
            timepoint_id: timepoint_id.into(),
            timepoint_type,
            visit_date,
            patient_id: patient_id.into(),
            study_instance_uids: BTreeSet::new(),
            timepoint_key: None,
            is_locked: false,
            visit_number: None,
        }
    }

    /// 关联一个检查
    pub fn with_study(mut self, study_instance_uid: impl Into<String>) -> Self {
        self.study_instance_uids.insert(study_instance_uid.into());
        self
    }

    /// 设置时间点标签
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.timepoint_key = Some(key.into());
        self
    }

    pub fn is_nadir(&self) -> bool {
        self.timepoint_key.as_deref() == Some(NADIR_KEY)
    }
}

/// 时间点的部分更新（浅合并）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimepointPatch {
    pub timepoint_type: Option<TimepointType>,
    pub visit_date: Option<NaiveDate>,
    pub timepoint_key: Option<String>,
    pub is_locked: Option<bool>,
    pub visit_number: Option<u32>,
    pub study_instance_uids: Option<BTreeSet<String>>,
}

impl TimepointPatch {
    pub fn apply_to(&self, timepoint: &mut Timepoint) {
        if let Some(timepoint_type) = self.timepoint_type {
            timepoint.timepoint_type = timepoint_type;
        }
        if let Some(visit_date) = self.visit_date {
            timepoint.visit_date = visit_date;
        }
        if let Some(key) = &self.timepoint_key {
            timepoint.timepoint_key = Some(key.clone());
        }
        if let Some(is_locked) = self.is_locked {
            timepoint.is_locked = is_locked;
        }
        if let Some(visit_number) = self.visit_number {
            timepoint.visit_number = Some(visit_number);
        }
        if let Some(uids) = &self.study_instance_uids {
            timepoint.study_instance_uids = uids.clone();
        }
    }
}

/// 时间点检索过滤器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimepointFilter {
    pub patient_id: Option<String>,
    pub timepoint_ids: Option<Vec<String>>,
    pub study_instance_uid: Option<String>,
}

impl TimepointFilter {
    pub fn for_patient(patient_id: impl Into<String>) -> Self {
        Self {
            patient_id: Some(patient_id.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, timepoint: &Timepoint) -> bool {
        if let Some(patient_id) = &self.patient_id {
            if &timepoint.patient_id != patient_id {
                return false;
            }
        }
        if let Some(ids) = &self.timepoint_ids {
            if !ids.contains(&timepoint.timepoint_id) {
                return false;
            }
        }
        if let Some(uid) = &self.study_instance_uid {
            if !timepoint.study_instance_uids.contains(uid) {
                return false;
            }
        }
        true
    }
}

/// 测量附加数据
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalData {
    /// 稳定的患者解剖位置锚点
    pub patient_location_id: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// 测量结构：单一测量或由若干子测量组成（如长轴与短轴）
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "parts", rename_all = "camelCase")]
pub enum FindingShape {
    #[default]
    Simple,
    Composite(Vec<Finding>),
}

/// 测量（病灶发现）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    #[serde(default)]
    pub id: String,
    pub finding_type: String,
    /// 0 表示尚未分配
    #[serde(default)]
    pub lesion_naming_number: u32,
    /// 0 表示尚未分配
    #[serde(default)]
    pub measurement_number: u32,
    #[serde(default)]
    pub timepoint_id: Option<String>,
    #[serde(default)]
    pub study_instance_uid: Option<String>,
    /// 工具状态桥接使用的影像标识
    #[serde(default)]
    pub image_id: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub additional_data: AdditionalData,
    #[serde(default)]
    pub is_split_lesion: bool,
    #[serde(default)]
    pub is_nodal: bool,
    #[serde(default)]
    pub is_read_only: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub shape: FindingShape,
}

impl Finding {
    pub fn new(finding_type: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            finding_type: finding_type.into(),
            lesion_naming_number: 0,
            measurement_number: 0,
            timepoint_id: None,
            study_instance_uid: None,
            image_id: None,
            location: None,
            description: None,
            label: None,
            additional_data: AdditionalData::default(),
            is_split_lesion: false,
            is_nodal: false,
            is_read_only: false,
            created_at: Utc::now(),
            shape: FindingShape::Simple,
        }
    }

    pub fn patient_location_id(&self) -> Option<&str> {
        self.additional_data.patient_location_id.as_deref()
    }

    pub fn parts(&self) -> &[Finding] {
        match &self.shape {
            FindingShape::Simple => &[],
            FindingShape::Composite(parts) => parts,
        }
    }

    /// 设置编号，组合测量的子测量同步更新
    pub fn set_numbers(&mut self, lesion_naming_number: u32, measurement_number: u32) {
        self.lesion_naming_number = lesion_naming_number;
        self.measurement_number = measurement_number;
        if let FindingShape::Composite(parts) = &mut self.shape {
            for part in parts {
                part.set_numbers(lesion_naming_number, measurement_number);
            }
        }
    }
}

/// 分类索引行：指向某条测量的轻量记录
///
/// 没有 `finding_id` 的行是渲染层在测量数据生成之前创建的占位行。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IndexRow {
    pub finding_type: Option<String>,
    pub finding_id: Option<String>,
    pub timepoint_id: String,
    pub study_instance_uid: Option<String>,
    pub lesion_naming_number: u32,
    pub measurement_number: u32,
    pub created_at: Option<DateTime<Utc>>,
}

impl IndexRow {
    pub fn placeholder(
        timepoint_id: impl Into<String>,
        lesion_naming_number: u32,
        measurement_number: u32,
    ) -> Self {
        Self {
            finding_type: None,
            finding_id: None,
            timepoint_id: timepoint_id.into(),
            study_instance_uid: None,
            lesion_naming_number,
            measurement_number,
            created_at: None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.finding_id.is_none()
    }
}

/// 索引查询结果：已记录的测量或仅有编号的占位
#[derive(Debug, Clone, PartialEq)]
pub enum FetchedFinding {
    Recorded(Finding),
    Placeholder { lesion_naming_number: u32 },
}

impl FetchedFinding {
    pub fn lesion_naming_number(&self) -> u32 {
        match self {
            FetchedFinding::Recorded(finding) => finding.lesion_naming_number,
            FetchedFinding::Placeholder { lesion_naming_number } => *lesion_naming_number,
        }
    }

    pub fn as_recorded(&self) -> Option<&Finding> {
        match self {
            FetchedFinding::Recorded(finding) => Some(finding),
            FetchedFinding::Placeholder { .. } => None,
        }
    }
}

/// 批量删除测量时使用的过滤条件（各字段取交集）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindingFilter {
    pub timepoint_id: Option<String>,
    pub lesion_naming_number: Option<u32>,
    pub measurement_number: Option<u32>,
    pub study_instance_uid: Option<String>,
    pub finding_type: Option<String>,
}

impl FindingFilter {
    pub fn matches_row(&self, row: &IndexRow) -> bool {
        self.timepoint_id.as_ref().map_or(true, |id| &row.timepoint_id == id)
            && self
                .lesion_naming_number
                .map_or(true, |n| row.lesion_naming_number == n)
            && self
                .measurement_number
                .map_or(true, |n| row.measurement_number == n)
            && self
                .study_instance_uid
                .as_ref()
                .map_or(true, |uid| row.study_instance_uid.as_ref() == Some(uid))
            && self
                .finding_type
                .as_ref()
                .map_or(true, |t| row.finding_type.as_ref() == Some(t))
    }

    pub fn matches_finding(&self, finding: &Finding) -> bool {
        self.timepoint_id
            .as_ref()
            .map_or(true, |id| finding.timepoint_id.as_ref() == Some(id))
            && self
                .lesion_naming_number
                .map_or(true, |n| finding.lesion_naming_number == n)
            && self
                .measurement_number
                .map_or(true, |n| finding.measurement_number == n)
            && self
                .study_instance_uid
                .as_ref()
                .map_or(true, |uid| finding.study_instance_uid.as_ref() == Some(uid))
            && self
                .finding_type
                .as_ref()
                .map_or(true, |t| &finding.finding_type == t)
    }

    /// 去掉时间点与病灶命名编号条件后的过滤器
    pub fn without_position(&self) -> Self {
        Self {
            timepoint_id: None,
            lesion_naming_number: None,
            ..self.clone()
        }
    }
}

/// 测量保存时的范围
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageFilter {
    pub patient_id: Option<String>,
    pub timepoint_ids: Vec<String>,
}

/// 按分类ID分组的测量数据（持久化层的交换格式）
pub type MeasurementData = BTreeMap<String, Vec<Finding>>;

/// 按测量类型分组的测量快照（通知订阅者）
pub type CategorySnapshot = BTreeMap<String, Vec<Finding>>;

#[cfg(test)]
mod tests {
    use super::*;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    #[test]
    fn test_timepoint_patch_merges_only_present_fields() {
        let mut tp = Timepoint::new("tp1", TimepointType::Followup, date(1), "p1").with_study("1.2.3");
        let patch = TimepointPatch {
            timepoint_key: Some(NADIR_KEY.to_string()),
            is_locked: Some(true),
            ..Default::default()
        };
        patch.apply_to(&mut tp);

        assert!(tp.is_nadir());
        assert!(tp.is_locked);
        assert_eq!(tp.visit_date, date(1));
        assert!(tp.study_instance_uids.contains("1.2.3"));
    }

    #[test]
    fn test_composite_numbers_propagate_to_parts() {
        let mut finding = Finding::new("bidirectional");
        finding.shape = FindingShape::Composite(vec![Finding::new("longAxis"), Finding::new("shortAxis")]);
        finding.set_numbers(2, 5);

        assert!(finding
            .parts()
            .iter()
            .all(|p| p.lesion_naming_number == 2 && p.measurement_number == 5));
    }

    #[test]
    fn test_finding_filter_without_position() {
        let filter = FindingFilter {
            timepoint_id: Some("tp1".into()),
            lesion_naming_number: Some(3),
            finding_type: Some("bidirectional".into()),
            ..Default::default()
        };
        let relaxed = filter.without_position();
        assert!(relaxed.timepoint_id.is_none());
        assert!(relaxed.lesion_naming_number.is_none());
        assert_eq!(relaxed.finding_type.as_deref(), Some("bidirectional"));
    }

    #[test]
    fn test_finding_deserializes_with_defaults() {
        let json = r#"{"findingType":"bidirectional","additionalData":{"patientLocationId":"liver-1","organ":"liver"}}"#;
        let finding: Finding = serde_json::from_str(json).unwrap();
        assert_eq!(finding.lesion_naming_number, 0);
        assert_eq!(finding.patient_location_id(), Some("liver-1"));
        assert_eq!(finding.additional_data.extra.get("organ"), Some(&serde_json::json!("liver")));
        assert_eq!(finding.shape, FindingShape::Simple);
    }
}
