pub mod app_config;
pub mod control_plane;
pub mod dispatcher_worker;
pub mod logging;
pub mod tape_status;

pub use app_config::*;
pub use control_plane::*;
pub use dispatcher_worker::*;
pub use logging::*;
pub use tape_status::*;
