//! Per-channel decision logic.

use std::sync::Arc;

use tracing::debug;

use palaver_core::{Channel, ChannelRead, Message};
use palaver_store::ChatStore;

use crate::logic::message_is_newer_than_current;
use crate::state::ChannelState;

/// Owns (and is the only writer of) one [`ChannelState`].
pub struct ChannelLogic {
    state: Arc<ChannelState>,
    store: ChatStore,
}

impl ChannelLogic {
    pub(crate) fn new(state: Arc<ChannelState>, store: ChatStore) -> Self {
        Self { state, store }
    }

    pub fn state(&self) -> &Arc<ChannelState> {
        &self.state
    }

    pub fn upsert_message(&self, message: Message) {
        self.upsert_messages(vec![message]);
    }

    /// Merge messages into state.  A message replaces the held copy for its
    /// id only if it is not older (see
    /// [`message_is_newer_than_current`][crate::logic]); append/merge never
    /// produces duplicate ids because the state is keyed by id.
    pub fn upsert_messages(&self, messages: Vec<Message>) {
        let mut accepted_latest = None;

        self.state.modify_messages(|current| {
            for message in messages {
                if message_is_newer_than_current(current.get(&message.id), &message) {
                    if let Some(created) = message.created_time() {
                        accepted_latest = accepted_latest.max(Some(created));
                    }
                    current.insert(message.id.clone(), message);
                } else {
                    debug!(id = %message.id, "dropping stale message copy");
                }
            }
        });

        if let Some(latest) = accepted_latest {
            self.state.advance_last_message_at(latest);
        }
    }

    /// Drop a local-only message (e.g. after the user discards a failed
    /// send).
    pub fn remove_local_message(&self, message_id: &str) {
        self.state.modify_messages(|current| {
            current.remove(message_id);
        });
    }

    /// Apply a server channel snapshot into state and clear the recovery
    /// flag.
    pub fn hydrate(&self, channel: &Channel) {
        let mut data = channel.clone();
        let messages = std::mem::take(&mut data.messages);

        self.state.set_members(
            data.members
                .iter()
                .map(|m| (m.user.id.clone(), m.clone()))
                .collect(),
        );
        self.state.set_reads(
            data.reads
                .iter()
                .map(|r| (r.user_id.clone(), r.clone()))
                .collect(),
        );
        self.state.set_unread_count(self.unread_for_current(&data));
        if let Some(at) = data.last_message_at {
            self.state.advance_last_message_at(at);
        }
        self.state.set_channel_data(Some(data));

        if !messages.is_empty() {
            self.upsert_messages(messages);
        }

        self.state.set_recovery_needed(false);
    }

    /// A message arrived while live: merge it and bump the unread counter
    /// when it is someone else's.
    pub(crate) fn on_new_message(&self, message: Message) {
        let from_someone_else = self
            .store
            .current_user_id()
            .map_or(false, |me| me != message.user_id);

        self.upsert_message(message);

        if from_someone_else {
            let unread = *self.state.unread_count().borrow() + 1;
            self.state.set_unread_count(unread);
        }
    }

    /// A user marked the channel read.
    pub(crate) fn on_message_read(&self, read: ChannelRead) {
        let is_current = self
            .store
            .current_user_id()
            .map_or(false, |me| me == read.user_id);

        self.state.modify_reads(|reads| {
            reads.insert(read.user_id.clone(), read);
        });

        if is_current {
            self.state.set_unread_count(0);
        }
    }

    pub(crate) fn upsert_member(&self, member: palaver_core::Member) {
        self.state.modify_members(|members| {
            members.insert(member.user.id.clone(), member);
        });
    }

    pub(crate) fn remove_member(&self, user_id: &str) {
        self.state.modify_members(|members| {
            members.remove(user_id);
        });
    }

    fn unread_for_current(&self, channel: &Channel) -> u64 {
        self.store
            .current_user_id()
            .and_then(|me| channel.reads.iter().find(|r| r.user_id == me))
            .map(|r| r.unread_messages)
            .unwrap_or(channel.unread_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use palaver_core::{Cid, SyncStatus};
    use palaver_store::Database;

    fn at(secs: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn logic() -> ChannelLogic {
        let store = ChatStore::new(Database::open_in_memory().unwrap());
        let cid = Cid::new("messaging", "general");
        ChannelLogic::new(Arc::new(ChannelState::new(cid)), store)
    }

    fn message(id: &str, secs: i64) -> Message {
        let mut msg = Message::new_local(
            Cid::new("messaging", "general"),
            "u1",
            "hello",
            vec![],
            at(secs),
        );
        msg.id = id.into();
        msg
    }

    #[test]
    fn merge_never_produces_duplicate_ids() {
        let logic = logic();
        logic.upsert_messages(vec![message("m1", 10), message("m1", 10), message("m2", 20)]);
        assert_eq!(logic.state().sorted_messages().len(), 2);
    }

    #[test]
    fn messages_are_sorted_by_creation_time() {
        let logic = logic();
        logic.upsert_messages(vec![message("m2", 20), message("m1", 10), message("m3", 30)]);
        let ids: Vec<String> = logic
            .state()
            .sorted_messages()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, ["m1", "m2", "m3"]);
    }

    #[test]
    fn completed_copy_displaces_regardless_of_arrival_order() {
        let mut first = message("m1", 10);
        first.sync_status = SyncStatus::Completed;
        first.created_at = Some(at(10));
        first.updated_at = Some(at(20));
        first.text = "old".into();

        let mut second = first.clone();
        second.updated_at = Some(at(30));
        second.text = "new".into();

        // arrival order A
        let logic_a = logic();
        logic_a.upsert_message(first.clone());
        logic_a.upsert_message(second.clone());
        assert_eq!(logic_a.state().message("m1").unwrap().text, "new");

        // arrival order B
        let logic_b = logic();
        logic_b.upsert_message(second);
        logic_b.upsert_message(first);
        assert_eq!(logic_b.state().message("m1").unwrap().text, "new");
    }

    #[test]
    fn last_message_at_advances_with_accepted_messages() {
        let logic = logic();
        logic.upsert_message(message("m1", 10));
        logic.upsert_message(message("m2", 30));
        logic.upsert_message(message("m3", 20));
        assert_eq!(*logic.state().last_message_at().borrow(), Some(at(30)));
    }

    #[test]
    fn new_message_from_someone_else_bumps_unread() {
        let logic = logic();
        logic.store.set_current_user_id("me-user");

        let mut theirs = message("m1", 10);
        theirs.user_id = "other".into();
        logic.on_new_message(theirs);
        assert_eq!(*logic.state().unread_count().borrow(), 1);

        let mut mine = message("m2", 20);
        mine.user_id = "me-user".into();
        logic.on_new_message(mine);
        assert_eq!(*logic.state().unread_count().borrow(), 1);
    }

    #[test]
    fn own_read_marker_clears_unread() {
        let logic = logic();
        logic.store.set_current_user_id("me-user");

        let mut theirs = message("m1", 10);
        theirs.user_id = "other".into();
        logic.on_new_message(theirs);

        logic.on_message_read(ChannelRead {
            user_id: "me-user".into(),
            last_read: Some(at(11)),
            unread_messages: 0,
        });
        assert_eq!(*logic.state().unread_count().borrow(), 0);
    }

    #[test]
    fn hydrate_clears_recovery_flag() {
        let logic = logic();
        assert!(logic.state().recovery_needed());

        let channel = Channel::new(Cid::new("messaging", "general"));
        logic.hydrate(&channel);
        assert!(!logic.state().recovery_needed());
    }
}
