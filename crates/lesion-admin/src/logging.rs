//! 日志初始化

use anyhow::{anyhow, Context, Result};
use tracing_subscriber::EnvFilter;

/// 初始化全局日志订阅者
///
/// `RUST_LOG` 环境变量优先，否则使用传入的级别或过滤指令。
pub fn init_logging(level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).with_context(|| format!("Invalid log filter: {}", level))?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize logging: {}", e))
}
