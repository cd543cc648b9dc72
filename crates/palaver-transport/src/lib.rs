//! # palaver-transport
//!
//! The wire-transport collaborator boundary.  The engine never speaks a
//! protocol itself: it sends [`TransportCommand`]s into an `mpsc` channel,
//! each carrying a `oneshot` reply slot, and consumes a stream of decoded
//! [`TransportEvent`]s.  Whatever services the channel -- a websocket+REST
//! client in production, a plain task in tests -- is invisible to the engine.
//!
//! Errors are classified permanent vs. transient ([`TransportError`]); the
//! sync layer keys its retry decisions off that classification.

pub mod commands;
pub mod events;

mod error;

pub use commands::{
    QueryChannelsRequest, TransportCommand, TransportHandle, UploadProgress, UploadRequest,
    UploadedFile,
};
pub use error::{ErrorKind, TransportError};
pub use events::TransportEvent;
