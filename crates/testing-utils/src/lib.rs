//! # Archiver Testing Utils
//!
//! 工作区共享的测试替身：内存控制面、脚本化的外部命令和固定结果的磁带探测。
//!
//! ```toml
//! [dev-dependencies]
//! archiver-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod mocks;

pub use builders::*;
pub use mocks::*;
