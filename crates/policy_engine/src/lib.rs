pub mod domain;
pub mod mqtt;
mod policy_engine;

pub use policy_engine::*;
