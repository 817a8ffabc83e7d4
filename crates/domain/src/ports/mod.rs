//! 领域端口定义
//!
//! Worker通过这些抽象与外部协作者交互，具体实现位于 `archiver-worker`。

pub mod control_plane;

pub use control_plane::*;
