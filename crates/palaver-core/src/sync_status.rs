//! Per-entity state machines tracking local-vs-remote confirmation.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Sync state of a locally-mutated entity (message, reaction, channel).
///
/// `SyncNeeded` entities are retried on the next recovery pass, oldest first.
/// `FailedPermanently` is terminal and never auto-retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStatus {
    /// Queued locally, waiting to be sent (or re-sent) to the server.
    SyncNeeded,
    /// A send is currently in flight.
    InProgress,
    /// Confirmed by the server.
    Completed,
    /// Rejected with a permanent error; requires explicit user action.
    FailedPermanently,
    /// Waiting for the entity's attachment uploads to finish.
    AwaitingAttachments,
}

impl SyncStatus {
    /// Stable integer codes used by the storage layer.
    pub fn code(self) -> i64 {
        match self {
            SyncStatus::SyncNeeded => 1,
            SyncStatus::InProgress => 2,
            SyncStatus::Completed => 3,
            SyncStatus::FailedPermanently => 4,
            SyncStatus::AwaitingAttachments => 5,
        }
    }

    pub fn from_code(code: i64) -> Result<Self, CoreError> {
        match code {
            1 => Ok(SyncStatus::SyncNeeded),
            2 => Ok(SyncStatus::InProgress),
            3 => Ok(SyncStatus::Completed),
            4 => Ok(SyncStatus::FailedPermanently),
            5 => Ok(SyncStatus::AwaitingAttachments),
            other => Err(CoreError::UnknownSyncStatus(other)),
        }
    }

    /// Whether `next` is a legal transition from this state.
    pub fn can_transition_to(self, next: SyncStatus) -> bool {
        use SyncStatus::*;
        match (self, next) {
            (SyncNeeded, InProgress) => true,
            (InProgress, Completed)
            | (InProgress, FailedPermanently)
            | (InProgress, SyncNeeded) => true,
            (AwaitingAttachments, SyncNeeded) | (AwaitingAttachments, FailedPermanently) => true,
            _ => false,
        }
    }
}

/// Upload state of a single attachment.
///
/// Only `Idle` and `InProgress` attachments are eligible for (re)upload;
/// `Success` attachments are skipped when a message is retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum UploadState {
    Idle,
    InProgress { bytes_uploaded: u64, total_bytes: u64 },
    Success { url: String },
    Failed { error: String },
}

impl UploadState {
    pub fn is_upload_eligible(&self) -> bool {
        matches!(self, UploadState::Idle | UploadState::InProgress { .. })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, UploadState::Success { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, UploadState::Failed { .. })
    }
}

impl Default for UploadState {
    fn default() -> Self {
        UploadState::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_round_trip() {
        for status in [
            SyncStatus::SyncNeeded,
            SyncStatus::InProgress,
            SyncStatus::Completed,
            SyncStatus::FailedPermanently,
            SyncStatus::AwaitingAttachments,
        ] {
            assert_eq!(SyncStatus::from_code(status.code()).unwrap(), status);
        }
        assert!(SyncStatus::from_code(42).is_err());
    }

    #[test]
    fn legal_transitions() {
        use SyncStatus::*;
        assert!(SyncNeeded.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(FailedPermanently));
        assert!(InProgress.can_transition_to(SyncNeeded));
        assert!(AwaitingAttachments.can_transition_to(SyncNeeded));
        assert!(AwaitingAttachments.can_transition_to(FailedPermanently));
    }

    #[test]
    fn illegal_transitions() {
        use SyncStatus::*;
        assert!(!Completed.can_transition_to(SyncNeeded));
        assert!(!FailedPermanently.can_transition_to(InProgress));
        assert!(!SyncNeeded.can_transition_to(Completed));
        assert!(!AwaitingAttachments.can_transition_to(Completed));
    }

    #[test]
    fn upload_eligibility() {
        assert!(UploadState::Idle.is_upload_eligible());
        assert!(UploadState::InProgress {
            bytes_uploaded: 1,
            total_bytes: 2
        }
        .is_upload_eligible());
        assert!(!UploadState::Success { url: "u".into() }.is_upload_eligible());
        assert!(!UploadState::Failed { error: "e".into() }.is_upload_eligible());
    }
}
