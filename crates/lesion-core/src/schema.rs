//! 分类（工具组）配置结构

use crate::error::{Result, TrackerError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

pub const TARGETS_CATEGORY_ID: &str = "targets";
pub const NON_TARGETS_CATEGORY_ID: &str = "nonTargets";
/// 临时分类，不参与编号去重和级联调整
pub const TEMP_CATEGORY_ID: &str = "temp";

/// 病灶分类配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CategoryConfig {
    pub id: String,
    /// 标签前缀，例如 "Target"
    #[serde(default)]
    pub name: Option<String>,
    pub child_finding_types: Vec<String>,
    #[serde(default)]
    pub include_in_case_progress: bool,
}

impl CategoryConfig {
    pub fn new(id: impl Into<String>, child_finding_types: &[&str], include_in_case_progress: bool) -> Self {
        Self {
            id: id.into(),
            name: None,
            child_finding_types: child_finding_types.iter().map(|t| t.to_string()).collect(),
            include_in_case_progress,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn is_temp(&self) -> bool {
        self.id == TEMP_CATEGORY_ID
    }
}

/// 测量注册表配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementConfiguration {
    pub categories: Vec<CategoryConfig>,
}

impl MeasurementConfiguration {
    /// 测量类型到分类ID的映射
    pub fn finding_type_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        for category in &self.categories {
            for finding_type in &category.child_finding_types {
                map.insert(finding_type.clone(), category.id.clone());
            }
        }
        map
    }

    pub fn category(&self, category_id: &str) -> Option<&CategoryConfig> {
        self.categories.iter().find(|c| c.id == category_id)
    }

    /// 检查分类ID唯一且每个测量类型只属于一个分类
    pub fn validate(&self) -> Result<()> {
        let mut seen_categories = Vec::new();
        let mut seen_types: HashMap<&str, &str> = HashMap::new();

        for category in &self.categories {
            if category.id.is_empty() {
                return Err(TrackerError::Validation("category id must not be empty".to_string()));
            }
            if seen_categories.contains(&category.id.as_str()) {
                return Err(TrackerError::Validation(format!("duplicate category id: {}", category.id)));
            }
            seen_categories.push(category.id.as_str());

            if category.child_finding_types.is_empty() {
                return Err(TrackerError::Validation(format!(
                    "category {} declares no finding types",
                    category.id
                )));
            }

            for finding_type in &category.child_finding_types {
                if let Some(owner) = seen_types.insert(finding_type.as_str(), category.id.as_str()) {
                    return Err(TrackerError::Validation(format!(
                        "finding type {} belongs to both {} and {}",
                        finding_type, owner, category.id
                    )));
                }
            }
        }

        Ok(())
    }
}

impl Default for MeasurementConfiguration {
    fn default() -> Self {
        Self {
            categories: vec![
                CategoryConfig::new(
                    TARGETS_CATEGORY_ID,
                    &["bidirectional", "targetCR", "targetUN", "targetEX"],
                    true,
                )
                .with_name("Target"),
                CategoryConfig::new(NON_TARGETS_CATEGORY_ID, &["nonTarget"], true).with_name("Non-Target"),
                CategoryConfig::new(TEMP_CATEGORY_ID, &["length", "ellipticalRoi"], false),
            ],
        }
    }
}

/// 默认比较时间点的选择方式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonKey {
    #[default]
    Baseline,
    Nadir,
    Prior,
}

impl fmt::Display for ComparisonKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComparisonKey::Baseline => write!(f, "baseline"),
            ComparisonKey::Nadir => write!(f, "nadir"),
            ComparisonKey::Prior => write!(f, "prior"),
        }
    }
}

impl FromStr for ComparisonKey {
    type Err = TrackerError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "baseline" => Ok(Self::Baseline),
            "nadir" => Ok(Self::Nadir),
            "prior" => Ok(Self::Prior),
            _ => Err(TrackerError::Validation(format!("unknown comparison key: {}", value))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configuration_is_valid() {
        let config = MeasurementConfiguration::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.finding_type_map().get("nonTarget").map(String::as_str), Some(NON_TARGETS_CATEGORY_ID));
    }

    #[test]
    fn test_finding_type_in_two_categories_is_rejected() {
        let config = MeasurementConfiguration {
            categories: vec![
                CategoryConfig::new("a", &["length"], true),
                CategoryConfig::new("b", &["length"], true),
            ],
        };
        assert!(matches!(config.validate(), Err(TrackerError::Validation(_))));
    }

    #[test]
    fn test_comparison_key_parse() {
        assert_eq!("nadir".parse::<ComparisonKey>().unwrap(), ComparisonKey::Nadir);
        assert!("current".parse::<ComparisonKey>().is_err());
    }
}
