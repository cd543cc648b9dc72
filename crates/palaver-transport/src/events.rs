//! Decoded realtime events sent *from* the transport task to the engine.
//!
//! Transport-level framing and decoding happen on the other side of the
//! channel; by the time an event reaches the engine it carries full domain
//! entities.

use chrono::{DateTime, Utc};

use palaver_core::{Channel, Cid, Member, Message, Poll, PollAnswer, PollVote, Reaction, User};

/// One decoded realtime event.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The realtime connection is up.  `me` is the authenticated user.
    Connected { connection_id: String, me: User },
    /// The realtime connection dropped.
    Disconnected { reason: Option<String> },

    /// A new message was posted.
    MessageNew { cid: Cid, message: Message },
    /// A message was edited.
    MessageUpdated { cid: Cid, message: Message },
    /// A message was deleted.  The message carries its `deleted_at`.
    MessageDeleted { cid: Cid, message: Message },

    /// A reaction was added.  `message` is the updated parent.
    ReactionNew {
        cid: Cid,
        message: Message,
        reaction: Reaction,
    },
    /// A reaction was removed.
    ReactionDeleted {
        cid: Cid,
        message: Message,
        reaction: Reaction,
    },

    /// Channel data changed (rename, config, freeze, ...).
    ChannelUpdated { channel: Channel },
    /// The channel is gone remotely.
    ChannelDeleted { cid: Cid },

    MemberAdded { cid: Cid, member: Member },
    MemberRemoved { cid: Cid, user_id: String },

    /// A user marked the channel read up to `last_read`.
    MessageRead {
        cid: Cid,
        user_id: String,
        last_read: DateTime<Utc>,
    },

    /// Poll sub-events, applied to the poll embedded in the parent message.
    PollVoteCast {
        cid: Cid,
        message_id: String,
        poll_id: String,
        vote: PollVote,
    },
    PollVoteRemoved {
        cid: Cid,
        message_id: String,
        poll_id: String,
        vote: PollVote,
    },
    PollAnswerCast {
        cid: Cid,
        message_id: String,
        poll_id: String,
        answer: PollAnswer,
    },
    PollClosed {
        cid: Cid,
        message_id: String,
        poll_id: String,
    },
    /// Full poll refresh.
    PollUpdated {
        cid: Cid,
        message_id: String,
        poll: Poll,
    },

    /// A message reminder fired.
    ReminderDue {
        cid: Cid,
        message_id: String,
        remind_at: DateTime<Utc>,
    },

    /// A profile changed; denormalized copies should refresh.
    UserUpdated { user: User },
}

impl TransportEvent {
    /// The channel this event belongs to, when it is channel-scoped.
    pub fn cid(&self) -> Option<&Cid> {
        match self {
            TransportEvent::MessageNew { cid, .. }
            | TransportEvent::MessageUpdated { cid, .. }
            | TransportEvent::MessageDeleted { cid, .. }
            | TransportEvent::ReactionNew { cid, .. }
            | TransportEvent::ReactionDeleted { cid, .. }
            | TransportEvent::ChannelDeleted { cid }
            | TransportEvent::MemberAdded { cid, .. }
            | TransportEvent::MemberRemoved { cid, .. }
            | TransportEvent::MessageRead { cid, .. }
            | TransportEvent::PollVoteCast { cid, .. }
            | TransportEvent::PollVoteRemoved { cid, .. }
            | TransportEvent::PollAnswerCast { cid, .. }
            | TransportEvent::PollClosed { cid, .. }
            | TransportEvent::PollUpdated { cid, .. }
            | TransportEvent::ReminderDue { cid, .. } => Some(cid),
            TransportEvent::ChannelUpdated { channel } => Some(&channel.cid),
            TransportEvent::Connected { .. }
            | TransportEvent::Disconnected { .. }
            | TransportEvent::UserUpdated { .. } => None,
        }
    }
}
