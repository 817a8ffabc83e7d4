//! 任务调度核心
//!
//! 内存中的 [`Queue`] 与 [`TaskManager`]：按特性分组轮询出队、按优先级分层、
//! 基于心跳回收失联服务的任务。

pub mod lost_task_monitor;
pub mod queue;
pub mod task_manager;

pub use lost_task_monitor::{LostTaskMonitor, LostTaskMonitorConfig};
pub use queue::{FeatureExtractor, Queue, QueueCallbacks, QueueItem, Selection};
pub use task_manager::{ManagerStatus, TaskManager, DEFAULT_STALENESS_THRESHOLD_SECONDS};
