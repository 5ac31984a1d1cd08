pub mod assistant;
pub mod message;
pub mod tool;
pub mod usage;

pub use assistant::*;
pub use message::*;
pub use tool::*;
pub use usage::*;
