mod command;
mod result;
mod snapshot;

pub use command::*;
pub use result::*;
pub use snapshot::*;
