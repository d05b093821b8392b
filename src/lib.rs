//! # Lesion Tracker
//!
//! 纵向病灶测量与时间点追踪系统的统一入口，重新导出各子模块。

pub use lesion_admin;
pub use lesion_core;
pub use lesion_integration;
pub use lesion_registry;

pub use lesion_core::{Finding, MeasurementConfiguration, Result, Timepoint, TimepointType, TrackerError};
pub use lesion_registry::{MeasurementRegistry, TimepointRegistry, TrackingSession};
