mod command_producer;
mod subscriber;

pub use command_producer::*;
pub use subscriber::*;
