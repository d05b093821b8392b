//! # 病灶追踪管理模块
//!
//! - 配置管理：TOML文件加环境变量覆盖、配置验证、写回
//! - 日志初始化

pub mod config;
pub mod logging;

pub use config::{CategorySettings, ConfigManager, ConfigValidator, DataConfig, LoggingConfig, TimepointSettings, TrackerConfig};
pub use logging::init_logging;
