//! # Lesion Core
//!
//! 病灶追踪系统的核心模块，提供基础数据结构、错误定义、外部能力接口和通用工具。

pub mod capability;
pub mod error;
pub mod models;
pub mod schema;
pub mod utils;

pub use capability::{MeasurementStore, RegistryObserver, TimepointStore, ToolState, ToolStateBridge};
pub use error::{Result, TrackerError};
pub use models::*;
pub use schema::*;
