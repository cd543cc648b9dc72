use thiserror::Error;

/// Errors produced while constructing or parsing core domain values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A channel identifier that is not of the form `type:id`.
    #[error("Invalid cid `{0}`: expected `type:id`")]
    InvalidCid(String),

    /// An unknown sync-status code read back from storage.
    #[error("Unknown sync status code {0}")]
    UnknownSyncStatus(i64),
}
