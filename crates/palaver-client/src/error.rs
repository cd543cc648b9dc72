use thiserror::Error;

/// Errors surfaced by the client engine.
///
/// Transport failures on individual entities are generally *not* surfaced
/// here: they are recorded on the entity via its sync status and the
/// operation reports the entity's terminal state instead.  `ChatError` is
/// for local-only failures (rejected before any network attempt) and for
/// storage problems.
#[derive(Error, Debug)]
pub enum ChatError {
    /// An operation that needs an authenticated user ran without one.
    #[error("No current user is set")]
    NoCurrentUser,

    /// Malformed input, rejected synchronously with no state mutation.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Storage layer failure.
    #[error("Store error: {0}")]
    Store(#[from] palaver_store::StoreError),

    /// Transport failure on an operation with no entity to record it on.
    #[error("Transport error: {0}")]
    Transport(#[from] palaver_transport::TransportError),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ChatError>;
