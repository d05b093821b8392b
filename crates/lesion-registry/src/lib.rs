//! # 纵向测量注册表
//!
//! 为单个患者维护时间点目录与测量目录：
//! - 时间点注册表：排序、比较时间点选择、初始评估集合、命名
//! - 测量注册表：编号分配与回收、跨时间点病灶匹配、工具状态同步
//! - 追踪会话：把两个注册表与持久化接口组合在一起，切换患者时丢弃过期的检索结果

pub mod measurement;
pub mod session;
pub mod timepoint;

#[cfg(test)]
pub(crate) mod fixtures;

pub use measurement::{calculate_lesion_naming_number, MatchStrategy, MeasurementRegistry};
pub use session::{TrackerState, TrackingSession};
pub use timepoint::TimepointRegistry;
