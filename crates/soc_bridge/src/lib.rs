pub mod domain;
pub mod mqtt;
mod soc_bridge;

pub use soc_bridge::*;
