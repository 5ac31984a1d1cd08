pub mod config;
pub mod error;
pub mod input;
pub mod session;
pub mod sink;
pub mod storage;

pub use config::*;
pub use error::*;
pub use input::*;
pub use session::*;
pub use sink::*;
pub use storage::*;
