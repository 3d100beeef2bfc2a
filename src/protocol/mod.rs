//! Wire protocol: message framing and the worker/peer state machines.

pub mod message;
pub mod peer;
pub mod worker;

pub use message::{Message, MessageKind, PeerHello};
