//! Domain entities mirrored from the remote chat service.
//!
//! Every struct derives `Serialize`/`Deserialize`; the storage layer persists
//! nested collections (attachments, members, reads) as JSON columns and the
//! transport layer ships the same structs over its command channel.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sync_status::{SyncStatus, UploadState};
use crate::types::Cid;

/// Free-form extension map carried by most entities.  Opaque passthrough:
/// the engine persists and forwards it but never interprets the contents.
pub type ExtraData = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A user profile.  `id` is the stable identity; every event or API response
/// mentioning the user upserts this record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct User {
    pub id: String,
    pub name: String,
    pub image: String,
    pub role: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_active: Option<DateTime<Utc>>,
    pub invisible: bool,
    pub banned: bool,
    #[serde(default)]
    pub extra_data: ExtraData,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Member / read markers
// ---------------------------------------------------------------------------

/// Channel membership record, a denormalized user copy plus membership data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Member {
    pub user: User,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub banned: bool,
    pub channel_role: String,
}

impl Member {
    pub fn new(user: User) -> Self {
        Self {
            user,
            created_at: None,
            updated_at: None,
            banned: false,
            channel_role: String::new(),
        }
    }
}

/// Per-user read marker inside a channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelRead {
    pub user_id: String,
    pub last_read: Option<DateTime<Utc>>,
    pub unread_messages: u64,
}

// ---------------------------------------------------------------------------
// Attachment
// ---------------------------------------------------------------------------

/// Broad attachment classification derived from the MIME type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    Video,
    File,
}

impl AttachmentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AttachmentKind::Image => "image",
            AttachmentKind::Video => "video",
            AttachmentKind::File => "file",
        }
    }
}

/// A file attached to a message.  Before upload only `local_path` is set;
/// after a successful upload the remote fields are filled in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Attachment {
    /// Locally generated identity, stable across upload retries.
    pub upload_id: String,
    pub title: Option<String>,
    pub url: Option<String>,
    pub thumb_url: Option<String>,
    pub mime_type: Option<String>,
    pub file_size: Option<u64>,
    pub kind: Option<AttachmentKind>,
    /// Path of the local file to upload; `None` for server-originated
    /// attachments.
    pub local_path: Option<PathBuf>,
    #[serde(default)]
    pub upload_state: UploadState,
    #[serde(default)]
    pub extra_data: ExtraData,
}

impl Attachment {
    /// A fresh local attachment pending upload.
    pub fn from_local_file(path: impl Into<PathBuf>) -> Self {
        Self {
            upload_id: Uuid::new_v4().to_string(),
            local_path: Some(path.into()),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Reaction
// ---------------------------------------------------------------------------

/// A message reaction, keyed by (message id, user id, kind).
///
/// A locally-deleted reaction keeps its record with `deleted_at` set until
/// the deletion is confirmed remotely.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reaction {
    pub message_id: String,
    pub user_id: String,
    pub kind: String,
    pub score: u64,
    pub sync_status: SyncStatus,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub extra_data: ExtraData,
}

impl Reaction {
    pub fn new(
        message_id: impl Into<String>,
        user_id: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            user_id: user_id.into(),
            kind: kind.into(),
            score: 1,
            sync_status: SyncStatus::SyncNeeded,
            created_at: None,
            updated_at: None,
            deleted_at: None,
            extra_data: ExtraData::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Poll
// ---------------------------------------------------------------------------

/// One selectable poll option.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollOption {
    pub id: String,
    pub text: String,
}

/// A single cast vote.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollVote {
    pub id: String,
    pub option_id: String,
    pub user_id: String,
}

/// A free-form poll answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollAnswer {
    pub id: String,
    pub user_id: String,
    pub text: String,
}

/// A poll embedded in a message.  Vote/answer/close sub-events mutate a
/// running snapshot of this struct in arrival order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Poll {
    pub id: String,
    pub question: String,
    pub options: Vec<PollOption>,
    pub vote_counts: BTreeMap<String, u64>,
    pub own_votes: Vec<PollVote>,
    pub answers: Vec<PollAnswer>,
    pub closed: bool,
}

impl Poll {
    pub fn apply_vote_cast(&mut self, vote: PollVote) {
        *self.vote_counts.entry(vote.option_id.clone()).or_insert(0) += 1;
        // replace an earlier vote record by the same id
        self.own_votes.retain(|v| v.id != vote.id);
        self.own_votes.push(vote);
    }

    pub fn apply_vote_removed(&mut self, vote: &PollVote) {
        if let Some(count) = self.vote_counts.get_mut(&vote.option_id) {
            *count = count.saturating_sub(1);
        }
        self.own_votes.retain(|v| v.id != vote.id);
    }

    pub fn apply_answer_cast(&mut self, answer: PollAnswer) {
        self.answers.retain(|a| a.id != answer.id);
        self.answers.push(answer);
    }

    pub fn close(&mut self) {
        self.closed = true;
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A chat message.
///
/// Exactly one timestamp source is authoritative at a time: the local clock
/// (`created_locally_at`/`updated_locally_at`) until the server confirms the
/// message, server time (`created_at`/`updated_at`) once `sync_status`
/// reaches `Completed`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    /// Owning channel; unset until the message is bound to a channel.
    pub cid: Option<Cid>,
    pub text: String,
    pub user_id: String,
    /// Denormalized sender copy, refreshed opportunistically from the user
    /// repository.
    pub user: Option<User>,
    pub attachments: Vec<Attachment>,
    pub sync_status: SyncStatus,
    pub created_at: Option<DateTime<Utc>>,
    pub created_locally_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub updated_locally_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub own_reactions: Vec<Reaction>,
    pub reaction_counts: BTreeMap<String, u64>,
    pub mentioned_user_ids: Vec<String>,
    /// Thread linkage: id of the parent message, when this is a reply.
    pub parent_id: Option<String>,
    pub reply_count: u64,
    pub poll: Option<Poll>,
    #[serde(default)]
    pub extra_data: ExtraData,
}

impl Message {
    /// A new locally-created message with a generated globally-unique id.
    ///
    /// Starts `AwaitingAttachments` when any attachment needs uploading,
    /// `SyncNeeded` otherwise.
    pub fn new_local(
        cid: Cid,
        user_id: impl Into<String>,
        text: impl Into<String>,
        attachments: Vec<Attachment>,
        now: DateTime<Utc>,
    ) -> Self {
        let sync_status = if attachments.iter().any(|a| a.upload_state.is_upload_eligible()) {
            SyncStatus::AwaitingAttachments
        } else {
            SyncStatus::SyncNeeded
        };
        Self {
            id: Uuid::new_v4().to_string(),
            cid: Some(cid),
            text: text.into(),
            user_id: user_id.into(),
            user: None,
            attachments,
            sync_status,
            created_at: None,
            created_locally_at: Some(now),
            updated_at: None,
            updated_locally_at: None,
            deleted_at: None,
            own_reactions: Vec::new(),
            reaction_counts: BTreeMap::new(),
            mentioned_user_ids: Vec::new(),
            parent_id: None,
            reply_count: 0,
            poll: None,
            extra_data: ExtraData::new(),
        }
    }

    /// Creation time used for ordering: server time when known, the local
    /// clock before confirmation.
    pub fn created_time(&self) -> Option<DateTime<Utc>> {
        self.created_at.or(self.created_locally_at)
    }

    /// Latest server-side timestamp (`created_at`/`updated_at`/`deleted_at`).
    pub fn last_update_time(&self) -> DateTime<Utc> {
        [self.created_at, self.updated_at, self.deleted_at]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// Latest local timestamp (`created_locally_at`/`updated_locally_at`/
    /// `deleted_at`).
    pub fn last_local_update_time(&self) -> DateTime<Utc> {
        [self.created_locally_at, self.updated_locally_at, self.deleted_at]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// Whether any attachment still has to go through the upload pipeline.
    pub fn has_pending_attachments(&self) -> bool {
        self.attachments
            .iter()
            .any(|a| a.upload_state.is_upload_eligible())
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// Feature switches of a channel, as configured server-side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelConfig {
    pub typing_events: bool,
    pub read_events: bool,
    pub replies: bool,
    pub reactions: bool,
    pub uploads: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            typing_events: true,
            read_events: true,
            replies: true,
            reactions: true,
            uploads: true,
        }
    }
}

/// A conversation channel.  The `messages` list is an aggregate returned by
/// the server on queries/watches; the channels table persists only the
/// channel data itself (messages have their own table).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Channel {
    pub cid: Cid,
    pub name: String,
    pub image: String,
    pub created_by_id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub members: Vec<Member>,
    pub reads: Vec<ChannelRead>,
    pub unread_count: u64,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub config: ChannelConfig,
    pub sync_status: SyncStatus,
    #[serde(default)]
    pub extra_data: ExtraData,
}

impl Channel {
    pub fn new(cid: Cid) -> Self {
        Self {
            cid,
            name: String::new(),
            image: String::new(),
            created_by_id: String::new(),
            created_at: None,
            updated_at: None,
            deleted_at: None,
            last_message_at: None,
            members: Vec::new(),
            reads: Vec::new(),
            unread_count: 0,
            messages: Vec::new(),
            config: ChannelConfig::default(),
            sync_status: SyncStatus::Completed,
            extra_data: ExtraData::new(),
        }
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}

// ---------------------------------------------------------------------------
// SyncState
// ---------------------------------------------------------------------------

/// Per-user recovery checkpoint: the channels that were active and when the
/// last recovery pass completed.  Created on first successful connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncState {
    pub user_id: String,
    pub active_cids: Vec<Cid>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl SyncState {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            active_cids: Vec::new(),
            last_synced_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn new_local_message_without_attachments_needs_sync() {
        let msg = Message::new_local(Cid::new("messaging", "general"), "u1", "hi", vec![], at(10));
        assert_eq!(msg.sync_status, SyncStatus::SyncNeeded);
        assert_eq!(msg.created_time(), Some(at(10)));
        assert!(msg.created_at.is_none());
    }

    #[test]
    fn new_local_message_with_attachments_awaits_uploads() {
        let att = Attachment::from_local_file("/tmp/photo.png");
        let msg = Message::new_local(
            Cid::new("messaging", "general"),
            "u1",
            "hi",
            vec![att],
            at(10),
        );
        assert_eq!(msg.sync_status, SyncStatus::AwaitingAttachments);
        assert!(msg.has_pending_attachments());
    }

    #[test]
    fn local_ids_are_unique() {
        let cid = Cid::new("messaging", "general");
        let a = Message::new_local(cid.clone(), "u1", "a", vec![], at(1));
        let b = Message::new_local(cid, "u1", "b", vec![], at(1));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn server_time_wins_for_created_time() {
        let mut msg =
            Message::new_local(Cid::new("messaging", "general"), "u1", "hi", vec![], at(10));
        msg.created_at = Some(at(20));
        assert_eq!(msg.created_time(), Some(at(20)));
    }

    #[test]
    fn last_update_time_picks_latest_server_timestamp() {
        let mut msg =
            Message::new_local(Cid::new("messaging", "general"), "u1", "hi", vec![], at(10));
        msg.created_at = Some(at(20));
        msg.updated_at = Some(at(30));
        msg.deleted_at = Some(at(25));
        assert_eq!(msg.last_update_time(), at(30));
    }

    #[test]
    fn poll_vote_cast_and_removed() {
        let mut poll = Poll {
            id: "p1".into(),
            question: "?".into(),
            options: vec![PollOption {
                id: "o1".into(),
                text: "yes".into(),
            }],
            ..Default::default()
        };
        let vote = PollVote {
            id: "v1".into(),
            option_id: "o1".into(),
            user_id: "u1".into(),
        };
        poll.apply_vote_cast(vote.clone());
        assert_eq!(poll.vote_counts["o1"], 1);
        assert_eq!(poll.own_votes.len(), 1);

        poll.apply_vote_removed(&vote);
        assert_eq!(poll.vote_counts["o1"], 0);
        assert!(poll.own_votes.is_empty());
    }

    #[test]
    fn poll_vote_removal_never_underflows() {
        let mut poll = Poll::default();
        let vote = PollVote {
            id: "v1".into(),
            option_id: "o1".into(),
            user_id: "u1".into(),
        };
        poll.apply_vote_removed(&vote);
        assert!(poll.own_votes.is_empty());
    }
}
