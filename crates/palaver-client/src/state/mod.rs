//! Observable state containers.
//!
//! Every container is a set of single-writer `tokio::sync::watch` cells: the
//! owning logic component mutates through `pub(crate)` setters, consumers
//! subscribe read-only receivers.

pub mod channel;
pub mod queries;
pub mod thread;

pub use channel::ChannelState;
pub use queries::{QueryChannelsState, QueryThreadsState};
pub use thread::ThreadState;
