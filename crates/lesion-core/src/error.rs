//! 错误定义模块

use thiserror::Error;

/// 病灶追踪系统统一错误类型
#[derive(Error, Debug)]
pub enum TrackerError {
    /// 缺少必需的外部能力（持久化函数未配置等）
    #[error("配置错误: {0}")]
    Config(String),

    #[error("未知的病灶分类: {0}")]
    UnknownCategory(String),

    #[error("未知的测量类型: {0}")]
    UnknownFindingType(String),

    /// 外部持久化能力返回失败
    #[error("持久化错误: {0}")]
    Persistence(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("请求已取消: {0}")]
    Cancelled(String),

    #[error("验证错误: {0}")]
    Validation(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),
}

impl TrackerError {
    /// 是否为"能力未配置"类错误（调用方应记录日志并视为空操作）
    pub fn is_config(&self) -> bool {
        matches!(self, TrackerError::Config(_))
    }
}

/// 病灶追踪系统统一结果类型
pub type Result<T> = std::result::Result<T, TrackerError>;
