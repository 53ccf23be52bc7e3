pub mod id;
pub mod message;

pub use id::PeerId;
pub use message::{kind, unix_millis, Control, Message};
