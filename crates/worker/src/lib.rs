//! 数据传输服务的Worker端：外部命令、磁带会话、处理器和运行时

pub mod command;
pub mod handlers;
pub mod hsi;
pub mod http_control_plane;
pub mod paths;
pub mod probe;
pub mod runtime;
pub mod staging;

pub use command::{CommandOutput, CommandRunner, CommandSpec, TokioCommandRunner};
pub use handlers::{HandlerContext, HandlerRegistry, TaskHandler};
pub use hsi::{BatchSession, HsiClient, HsiLocateSession, SessionQueue, TapeLocation};
pub use http_control_plane::HttpControlPlane;
pub use probe::{HttpStatusProbe, ServiceProbe};
pub use runtime::WorkerRuntime;
pub use staging::StagingDir;
