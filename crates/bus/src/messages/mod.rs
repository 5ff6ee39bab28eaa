//! Payload types carried inside [`Message`](crate::Message) envelopes.
//!
//! - **Dispatch** (`dispatch`): coordinator to worker node execution
//! - **Events** (`events`): heartbeats and run lifecycle notifications
//! - **Topics** (`topics`): canonical topic strings for routing

pub mod dispatch;
pub mod events;
pub mod topics;

pub use dispatch::*;
pub use events::*;
