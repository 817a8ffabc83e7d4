pub mod entities;
pub mod payloads;
pub mod ports;
pub mod settings;
pub mod updates;
pub mod vocabulary;

pub use archiver_errors::{ArchiverError, ArchiverResult};
pub use entities::*;
pub use payloads::*;
pub use ports::*;
pub use settings::*;
pub use updates::*;
pub use vocabulary::*;
