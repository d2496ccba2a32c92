mod heartbeat;
mod publisher;
mod subscriber;
mod topic;

pub use heartbeat::*;
pub use publisher::*;
pub use subscriber::*;
pub use topic::*;
