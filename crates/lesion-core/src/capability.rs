//! 外部能力接口
//!
//! 注册表本身只在内存中工作，以下接口由调用方注入：
//! - 持久化层：时间点与测量的检索、保存、更新、删除
//! - 工具状态桥接：渲染层按影像标识和测量类型保存的标注状态
//! - 变更通知：目录发生变化时的同步回调

use crate::error::{Result, TrackerError};
use crate::models::{CategorySnapshot, Finding, MeasurementData, StorageFilter, Timepoint, TimepointFilter, TimepointPatch};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// 工具状态：影像标识 -> 测量类型 -> 标注条目
///
/// 使用有序映射，保证序列化结果稳定。
pub type ToolState = BTreeMap<String, BTreeMap<String, Vec<Finding>>>;

fn not_configured(function: &str) -> TrackerError {
    TrackerError::Config(format!("{} function has not been configured", function))
}

/// 时间点持久化接口
///
/// 只有检索是必需的，其余操作默认返回配置错误。
#[async_trait]
pub trait TimepointStore: Send + Sync {
    /// 检索时间点
    async fn retrieve_timepoints(&self, filter: &TimepointFilter) -> Result<Vec<Timepoint>>;

    /// 保存全部时间点
    async fn store_timepoints(&self, _timepoints: &[Timepoint]) -> Result<()> {
        Err(not_configured("Timepoint store"))
    }

    /// 更新单个时间点
    async fn update_timepoint(&self, _timepoint_id: &str, _patch: &TimepointPatch) -> Result<()> {
        Err(not_configured("Timepoint update"))
    }

    /// 删除单个时间点
    async fn remove_timepoint(&self, _timepoint_id: &str) -> Result<()> {
        Err(not_configured("Timepoint remove"))
    }

    /// 解除检查与时间点的关联
    async fn disassociate_study(&self, _timepoint_ids: &[String], _study_instance_uid: &str) -> Result<()> {
        Err(not_configured("Study disassociate"))
    }
}

/// 测量持久化接口
#[async_trait]
pub trait MeasurementStore: Send + Sync {
    /// 检索患者在指定时间点上的测量，按分类ID分组
    async fn retrieve_measurements(&self, patient_id: &str, timepoint_ids: &[String]) -> Result<MeasurementData>;

    /// 保存测量
    async fn store_measurements(&self, _data: &MeasurementData, _filter: &StorageFilter) -> Result<serde_json::Value> {
        Err(not_configured("Measurement store"))
    }
}

/// 工具状态桥接
pub trait ToolStateBridge: Send + Sync {
    fn save_state(&self) -> ToolState;

    fn restore_state(&self, state: ToolState);
}

/// 目录变更观察者
pub trait RegistryObserver: Send + Sync {
    fn on_timepoints_updated(&self, _timepoints: &[Timepoint]) {}

    fn on_measurements_updated(&self, _snapshot: &CategorySnapshot) {}
}
