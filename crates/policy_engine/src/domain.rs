mod device_map;
mod policy;
mod service;

pub use device_map::*;
pub use policy::*;
pub use service::*;
