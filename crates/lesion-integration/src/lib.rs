//! # 病灶追踪集成模块
//!
//! 提供注册表外部能力接口的现成实现：
//! - 内存存储与JSON文件存储，实现时间点与测量的持久化接口
//! - 内存工具状态，实现工具状态桥接
//! - 日志与广播观察者，实现目录变更通知

pub mod observer;
pub mod store;
pub mod tool_state;

pub use observer::{BroadcastObserver, LoggingObserver, RegistryEvent};
pub use store::{InMemoryStore, JsonFileStore, TrackerDocument};
pub use tool_state::InMemoryToolState;
