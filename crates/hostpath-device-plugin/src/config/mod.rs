pub mod cli;
pub mod device;

pub use cli::*;
pub use device::*;
