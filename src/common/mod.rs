//! Miscellaneous common structs used throughout the library.

mod id;
pub mod messages;

pub use id::*;
pub use messages::Message;
