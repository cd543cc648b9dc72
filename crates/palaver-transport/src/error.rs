use thiserror::Error;

/// Classified transport failure.
///
/// Transient errors leave the affected entity queued (`SyncNeeded`) for the
/// next recovery pass; permanent ones move it to `FailedPermanently` and are
/// never auto-retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The network is unreachable.
    NetworkUnreachable,
    /// The request timed out.
    Timeout,
    /// The server asked us to back off.
    RateLimited,
    /// The request was rejected as invalid.
    Validation,
    /// Authentication or authorization failure.
    Auth,
    /// The referenced entity does not exist remotely.
    NotFound,
    /// The transport task is gone (shutdown or cancellation).
    ConnectionClosed,
}

impl ErrorKind {
    pub fn is_permanent(self) -> bool {
        matches!(
            self,
            ErrorKind::Validation | ErrorKind::Auth | ErrorKind::NotFound
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::NetworkUnreachable => "network unreachable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate limited",
            ErrorKind::Validation => "validation failed",
            ErrorKind::Auth => "authentication failed",
            ErrorKind::NotFound => "not found",
            ErrorKind::ConnectionClosed => "connection closed",
        };
        f.write_str(s)
    }
}

/// Error returned by every transport call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Transport error ({kind}): {message}")]
pub struct TransportError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The transport task hung up before replying.
    pub fn connection_closed() -> Self {
        Self::new(ErrorKind::ConnectionClosed, "transport task is gone")
    }

    pub fn is_permanent(&self) -> bool {
        self.kind.is_permanent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(TransportError::new(ErrorKind::Validation, "bad cid").is_permanent());
        assert!(TransportError::new(ErrorKind::Auth, "expired token").is_permanent());
        assert!(TransportError::new(ErrorKind::NotFound, "gone").is_permanent());

        assert!(!TransportError::new(ErrorKind::NetworkUnreachable, "offline").is_permanent());
        assert!(!TransportError::new(ErrorKind::Timeout, "slow").is_permanent());
        assert!(!TransportError::new(ErrorKind::RateLimited, "429").is_permanent());
        assert!(!TransportError::connection_closed().is_permanent());
    }
}
