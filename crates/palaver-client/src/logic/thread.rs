//! Per-thread decision logic, including poll sub-event handling.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use palaver_core::Message;
use palaver_store::ChatStore;
use palaver_transport::TransportEvent;

use crate::logic::message_is_newer_than_current;
use crate::state::ThreadState;

/// Owns (and is the only writer of) one [`ThreadState`].
pub struct ThreadLogic {
    state: Arc<ThreadState>,
    store: ChatStore,
}

impl ThreadLogic {
    pub(crate) fn new(state: Arc<ThreadState>, store: ChatStore) -> Self {
        Self { state, store }
    }

    pub fn state(&self) -> &Arc<ThreadState> {
        &self.state
    }

    /// Set or refresh the parent message, applying the merge rule.
    pub fn upsert_parent(&self, parent: Message) {
        if parent.id != self.state.parent_id() {
            return;
        }
        self.state.modify_parent(|current| {
            if message_is_newer_than_current(current.as_ref(), &parent) {
                *current = Some(parent);
            }
        });
    }

    /// Merge a reply into the thread.  Replies belonging to other parents
    /// are ignored.
    pub fn upsert_reply(&self, reply: Message) {
        if reply.parent_id.as_deref() != Some(self.state.parent_id()) {
            return;
        }
        self.state.modify_replies(|replies| {
            if message_is_newer_than_current(replies.get(&reply.id), &reply) {
                replies.insert(reply.id.clone(), reply);
            }
        });
    }

    pub fn upsert_replies(&self, replies: Vec<Message>) {
        for reply in replies {
            self.upsert_reply(reply);
        }
    }

    /// Load the parent and its replies from the local mirror.
    pub fn hydrate_from_store(&self) -> crate::error::Result<()> {
        if let Some(parent) = self.store.select_message(self.state.parent_id())? {
            self.state.set_parent(Some(parent));
        }
        let replies = self.store.select_thread_replies(self.state.parent_id())?;
        self.upsert_replies(replies);
        Ok(())
    }

    /// Apply a poll/reminder sub-event to the poll snapshot embedded in the
    /// parent message, in arrival order.  The event is ignored when it
    /// references a different poll than the one currently attached.
    ///
    /// Returns the updated parent so the caller can persist it.
    pub fn apply_sub_event(&self, event: &TransportEvent) -> Option<Message> {
        let mut updated = None;

        self.state.modify_parent(|parent| {
            let Some(parent) = parent.as_mut() else {
                debug!("ignoring sub-event for thread without a parent snapshot");
                return;
            };

            if apply_sub_event_to_parent(parent, event) {
                updated = Some(parent.clone());
            }
        });

        updated
    }
}

/// Apply one poll/reminder sub-event to a parent message snapshot.  Shared
/// between live threads and the event dispatcher's store-only path.
pub(crate) fn apply_sub_event_to_parent(parent: &mut Message, event: &TransportEvent) -> bool {
    match event {
        TransportEvent::PollVoteCast { poll_id, vote, .. } => {
            with_matching_poll(parent, poll_id, |poll| poll.apply_vote_cast(vote.clone()))
        }
        TransportEvent::PollVoteRemoved { poll_id, vote, .. } => {
            with_matching_poll(parent, poll_id, |poll| poll.apply_vote_removed(vote))
        }
        TransportEvent::PollAnswerCast { poll_id, answer, .. } => {
            with_matching_poll(parent, poll_id, |poll| poll.apply_answer_cast(answer.clone()))
        }
        TransportEvent::PollClosed { poll_id, .. } => {
            with_matching_poll(parent, poll_id, |poll| poll.close())
        }
        TransportEvent::PollUpdated { poll, .. } => {
            parent.poll = Some(poll.clone());
            true
        }
        TransportEvent::ReminderDue { remind_at, .. } => {
            apply_reminder(parent, *remind_at);
            true
        }
        _ => false,
    }
}

/// Run `f` against the parent's poll when the event references it; ignore
/// events naming a different poll id.
fn with_matching_poll(
    parent: &mut Message,
    poll_id: &str,
    f: impl FnOnce(&mut palaver_core::Poll),
) -> bool {
    match parent.poll.as_mut() {
        Some(poll) if poll.id == poll_id => {
            f(poll);
            true
        }
        Some(poll) => {
            debug!(
                attached = %poll.id,
                referenced = %poll_id,
                "ignoring poll event for a different poll"
            );
            false
        }
        None => {
            debug!(referenced = %poll_id, "ignoring poll event, parent has no poll");
            false
        }
    }
}

fn apply_reminder(parent: &mut Message, remind_at: DateTime<Utc>) {
    parent.extra_data.insert(
        "latest_reminder_at".into(),
        serde_json::Value::String(remind_at.to_rfc3339()),
    );
}
