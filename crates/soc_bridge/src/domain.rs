mod device_state;
mod registry;
mod signals;
mod soc_filter;
mod state_filter;
mod validator;

pub use device_state::*;
pub use registry::*;
pub use signals::*;
pub use soc_filter::*;
pub use state_filter::*;
pub use validator::*;
