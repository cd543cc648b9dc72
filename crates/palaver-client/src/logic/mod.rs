//! Decision logic: how inbound messages, events and query results update the
//! observable state containers.

pub mod channel;
pub mod queries;
pub mod thread;

pub use channel::ChannelLogic;
pub use queries::{QueryChannelsLogic, QueryThreadsLogic};
pub use thread::ThreadLogic;

use palaver_core::{Channel, Message, SyncStatus};
use palaver_store::ChatStore;

use crate::error::Result;

/// Whether `incoming` should replace `current` in state.
///
/// A message replaces the held copy only if it is not older.  Age is judged
/// on server timestamps once the incoming message is `Completed`, and on
/// local timestamps otherwise: an optimistic local edit is not clobbered by
/// a stale server echo, and a stale local edit never overrides a confirmed
/// server state.
pub(crate) fn message_is_newer_than_current(current: Option<&Message>, incoming: &Message) -> bool {
    if incoming.sync_status == SyncStatus::Completed {
        current.map_or(true, |c| c.last_update_time() <= incoming.last_update_time())
    } else {
        current.map_or(true, |c| {
            c.last_local_update_time() <= incoming.last_local_update_time()
        })
    }
}

/// Persist server channel snapshots: channel rows (with their member users),
/// then every embedded message bound to its owning cid.
pub(crate) fn persist_channel_snapshots(store: &ChatStore, channels: &[Channel]) -> Result<()> {
    store.insert_channels(channels.to_vec())?;

    let mut messages = Vec::new();
    for channel in channels {
        for message in &channel.messages {
            let mut message = message.clone();
            message.cid = Some(channel.cid.clone());
            messages.push(message);
        }
    }
    store.insert_messages(messages)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use palaver_core::Cid;

    fn at(secs: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn message(id: &str, secs: i64) -> Message {
        let mut msg = Message::new_local(Cid::new("messaging", "general"), "u1", "x", vec![], at(secs));
        msg.id = id.into();
        msg
    }

    #[test]
    fn completed_with_later_server_time_displaces() {
        let mut held = message("m1", 10);
        held.sync_status = SyncStatus::Completed;
        held.created_at = Some(at(10));
        held.updated_at = Some(at(20));

        let mut incoming = message("m1", 10);
        incoming.sync_status = SyncStatus::Completed;
        incoming.created_at = Some(at(10));
        incoming.updated_at = Some(at(30));

        assert!(message_is_newer_than_current(Some(&held), &incoming));
        // and regardless of arrival order
        assert!(!message_is_newer_than_current(Some(&incoming), &held));
    }

    #[test]
    fn optimistic_local_edit_survives_stale_echo() {
        // local edit at t=50, not yet confirmed
        let mut local = message("m1", 10);
        local.updated_locally_at = Some(at(50));

        // stale pre-edit copy with older local timestamps
        let mut stale = message("m1", 10);
        stale.created_locally_at = Some(at(10));

        assert!(!message_is_newer_than_current(Some(&local), &stale));
    }

    #[test]
    fn confirmed_server_state_overrides_stale_local_copy() {
        let mut local = message("m1", 10);
        local.updated_locally_at = Some(at(50));

        let mut confirmed = message("m1", 10);
        confirmed.sync_status = SyncStatus::Completed;
        confirmed.created_at = Some(at(10));
        confirmed.updated_at = Some(at(60));

        assert!(message_is_newer_than_current(Some(&local), &confirmed));
    }

    #[test]
    fn missing_current_always_accepts() {
        assert!(message_is_newer_than_current(None, &message("m1", 10)));
    }

    #[test]
    fn equal_timestamps_accept_the_incoming_copy() {
        let held = message("m1", 10);
        let incoming = message("m1", 10);
        assert!(message_is_newer_than_current(Some(&held), &incoming));
    }
}
