#![doc = include_str!("../README.md")]

mod common;
mod error;
mod ring;
pub mod transport;

pub use common::{between_exclusive, Message, RingId, RING_BITS};
pub use error::{Error, Result};
pub use ring::{
    Config, FingerEntry, FingerTable, Info, NodeStatus, RingNode, DEFAULT_STABILIZE_INTERVAL,
};
pub use transport::{ConnectionId, Listener, Transport};
