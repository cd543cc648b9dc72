//! Realtime event dispatch.
//!
//! The dispatcher drains the transport's decoded event stream, persists
//! every entity an event carries, and routes state updates to whichever
//! channels/threads are live in the registry.  Entities of inactive
//! channels still reach the local mirror; only the reactive state is
//! skipped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use palaver_core::{ChannelRead, ConnectionStatus, Message, SyncState, User};
use palaver_store::ChatStore;
use palaver_transport::TransportEvent;

use crate::error::Result;
use crate::logic::thread::apply_sub_event_to_parent;
use crate::registry::ActiveEntities;
use crate::sync::SyncManager;

/// Applies decoded realtime events to repositories and live state.
pub struct EventDispatcher {
    store: ChatStore,
    registry: Arc<ActiveEntities>,
    sync: Arc<SyncManager>,
    status: watch::Sender<ConnectionStatus>,
    first_connect: AtomicBool,
}

impl EventDispatcher {
    pub(crate) fn new(
        store: ChatStore,
        registry: Arc<ActiveEntities>,
        sync: Arc<SyncManager>,
        status: watch::Sender<ConnectionStatus>,
    ) -> Self {
        Self {
            store,
            registry,
            sync,
            status,
            first_connect: AtomicBool::new(true),
        }
    }

    /// Main loop: drain the event stream until the transport hangs up.
    pub(crate) async fn run(self: Arc<Self>, mut event_rx: mpsc::Receiver<TransportEvent>) {
        info!("event loop started");
        while let Some(event) = event_rx.recv().await {
            if let Err(e) = self.dispatch(event).await {
                warn!(error = %e, "event dispatch failed");
            }
        }
        info!("event loop ended");
    }

    /// Apply a single event.
    pub async fn dispatch(&self, event: TransportEvent) -> Result<()> {
        match event {
            TransportEvent::Connected { connection_id, me } => {
                self.on_connected(connection_id, me).await?;
            }

            TransportEvent::Disconnected { reason } => {
                info!(reason = ?reason, "connection lost");
                self.status.send_replace(ConnectionStatus::Disconnected);
                self.registry.mark_all_recovery_needed();
            }

            TransportEvent::MessageNew { cid, mut message } => {
                message.cid = Some(cid.clone());
                self.store.insert_message(message.clone())?;
                if let Some(channel) = self.registry.channel_if_active(&cid) {
                    channel.on_new_message(message.clone());
                }
                self.route_to_thread(&message);
            }

            TransportEvent::MessageUpdated { cid, mut message }
            | TransportEvent::MessageDeleted { cid, mut message } => {
                message.cid = Some(cid.clone());
                self.store.insert_message(message.clone())?;
                if let Some(channel) = self.registry.channel_if_active(&cid) {
                    channel.upsert_message(message.clone());
                }
                self.route_to_thread(&message);
            }

            TransportEvent::ReactionNew {
                cid,
                mut message,
                reaction,
            } => {
                message.cid = Some(cid.clone());
                self.store.insert_reaction(reaction)?;
                self.store.insert_message(message.clone())?;
                if let Some(channel) = self.registry.channel_if_active(&cid) {
                    channel.upsert_message(message.clone());
                }
                self.route_to_thread(&message);
            }

            TransportEvent::ReactionDeleted {
                cid,
                mut message,
                reaction,
            } => {
                message.cid = Some(cid.clone());
                self.store.delete_reaction(
                    &reaction.message_id,
                    &reaction.user_id,
                    &reaction.kind,
                )?;
                self.store.insert_message(message.clone())?;
                if let Some(channel) = self.registry.channel_if_active(&cid) {
                    channel.upsert_message(message.clone());
                }
                self.route_to_thread(&message);
            }

            TransportEvent::ChannelUpdated { channel } => {
                self.store.insert_channel(channel.clone())?;
                if let Some(live) = self.registry.channel_if_active(&channel.cid) {
                    live.hydrate(&channel);
                }
            }

            TransportEvent::ChannelDeleted { cid } => {
                self.store.delete_channel(&cid)?;
                if let Some(live) = self.registry.channel_if_active(&cid) {
                    live.state().set_channel_data(None);
                }
            }

            TransportEvent::MemberAdded { cid, member } => {
                self.store.insert_user(member.user.clone())?;
                if let Some(mut channel) = self.store.select_channel(&cid)? {
                    channel.members.retain(|m| m.user.id != member.user.id);
                    channel.members.push(member.clone());
                    self.store.insert_channel(channel)?;
                }
                if let Some(live) = self.registry.channel_if_active(&cid) {
                    live.upsert_member(member);
                }
            }

            TransportEvent::MemberRemoved { cid, user_id } => {
                if let Some(mut channel) = self.store.select_channel(&cid)? {
                    channel.members.retain(|m| m.user.id != user_id);
                    self.store.insert_channel(channel)?;
                }
                if let Some(live) = self.registry.channel_if_active(&cid) {
                    live.remove_member(&user_id);
                }
            }

            TransportEvent::MessageRead {
                cid,
                user_id,
                last_read,
            } => {
                let read = ChannelRead {
                    user_id: user_id.clone(),
                    last_read: Some(last_read),
                    unread_messages: 0,
                };
                if let Some(mut channel) = self.store.select_channel(&cid)? {
                    channel.reads.retain(|r| r.user_id != user_id);
                    channel.reads.push(read.clone());
                    self.store.insert_channel(channel)?;
                }
                if let Some(live) = self.registry.channel_if_active(&cid) {
                    live.on_message_read(read);
                }
            }

            event @ (TransportEvent::PollVoteCast { .. }
            | TransportEvent::PollVoteRemoved { .. }
            | TransportEvent::PollAnswerCast { .. }
            | TransportEvent::PollClosed { .. }
            | TransportEvent::PollUpdated { .. }
            | TransportEvent::ReminderDue { .. }) => {
                self.on_sub_event(event)?;
            }

            TransportEvent::UserUpdated { user } => {
                self.store.insert_user(user)?;
            }
        }
        Ok(())
    }

    async fn on_connected(&self, connection_id: String, me: User) -> Result<()> {
        info!(connection_id = %connection_id, user = %me.id, "connection established");

        self.store.set_current_user_id(me.id.clone());
        self.store.insert_user(me.clone())?;

        // first successful connection for this user creates the checkpoint
        if self.store.select_sync_state(&me.id)?.is_none() {
            self.store.insert_sync_state(SyncState::new(me.id.clone()))?;
        }

        self.status.send_replace(ConnectionStatus::Connected);

        // first connect only recovers what is flagged; reconnects recover
        // everything
        let recover_all = !self.first_connect.swap(false, Ordering::SeqCst);
        if let Err(e) = self.sync.connection_recovered(recover_all).await {
            warn!(error = %e, "recovery pass failed");
        }
        Ok(())
    }

    /// Route a message to its thread when that thread is live.
    fn route_to_thread(&self, message: &Message) {
        if let Some(parent_id) = &message.parent_id {
            if let Some(thread) = self.registry.thread_if_active(parent_id) {
                thread.upsert_reply(message.clone());
            }
        }
        if let Some(thread) = self.registry.thread_if_active(&message.id) {
            thread.upsert_parent(message.clone());
        }
    }

    /// Poll/reminder sub-events mutate the parent message's embedded poll
    /// snapshot.  Live threads apply through their logic; otherwise the
    /// stored copy is updated directly.
    fn on_sub_event(&self, event: TransportEvent) -> Result<()> {
        let (cid, message_id) = match &event {
            TransportEvent::PollVoteCast { cid, message_id, .. }
            | TransportEvent::PollVoteRemoved { cid, message_id, .. }
            | TransportEvent::PollAnswerCast { cid, message_id, .. }
            | TransportEvent::PollClosed { cid, message_id, .. }
            | TransportEvent::PollUpdated { cid, message_id, .. }
            | TransportEvent::ReminderDue { cid, message_id, .. } => {
                (cid.clone(), message_id.clone())
            }
            _ => return Ok(()),
        };

        let updated = match self.registry.thread_if_active(&message_id) {
            Some(thread) => thread.apply_sub_event(&event),
            None => match self.store.select_message(&message_id)? {
                Some(mut parent) => {
                    apply_sub_event_to_parent(&mut parent, &event).then_some(parent)
                }
                None => {
                    debug!(message_id = %message_id, "sub-event for unknown message");
                    None
                }
            },
        };

        if let Some(parent) = updated {
            self.store.insert_message(parent.clone())?;
            if let Some(channel) = self.registry.channel_if_active(&cid) {
                channel.upsert_message(parent);
            }
        }
        Ok(())
    }
}

/// Spawn the event loop task.  Aborted when the owning session drops.
pub(crate) fn spawn_event_loop(
    dispatcher: Arc<EventDispatcher>,
    event_rx: mpsc::Receiver<TransportEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(dispatcher.run(event_rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    use palaver_core::Cid;

    use palaver_core::{Poll, PollVote, SyncStatus};
    use palaver_store::Database;
    use palaver_transport::{TransportCommand, TransportHandle};

    use crate::uploader::AttachmentUploader;

    fn cid() -> Cid {
        Cid::new("messaging", "general")
    }

    struct Harness {
        dispatcher: EventDispatcher,
        store: ChatStore,
        registry: Arc<ActiveEntities>,
        status_rx: watch::Receiver<ConnectionStatus>,
    }

    fn harness() -> Harness {
        let store = ChatStore::new(Database::open_in_memory().unwrap());
        let (transport, cmd_rx) = TransportHandle::channel(32);
        // a permissive transport double so recovery passes succeed quietly
        serve_everything(cmd_rx);

        let registry = Arc::new(ActiveEntities::new(store.clone(), transport.clone()));
        let uploader = Arc::new(AttachmentUploader::new(store.clone(), transport.clone()));
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let sync = Arc::new(SyncManager::new(
            store.clone(),
            transport,
            registry.clone(),
            uploader,
            status_rx.clone(),
        ));
        let dispatcher =
            EventDispatcher::new(store.clone(), registry.clone(), sync, status_tx);
        Harness {
            dispatcher,
            store,
            registry,
            status_rx,
        }
    }

    fn serve_everything(mut cmd_rx: mpsc::Receiver<TransportCommand>) {
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    TransportCommand::QueryChannels { reply, .. } => {
                        let _ = reply.send(Ok(vec![]));
                    }
                    TransportCommand::SendMessage { mut message, reply } => {
                        message.sync_status = SyncStatus::Completed;
                        let _ = reply.send(Ok(message));
                    }
                    _ => {}
                }
            }
        });
    }

    fn me() -> User {
        let mut user = User::new("me-user");
        user.name = "Me".into();
        user
    }

    fn server_message(id: &str, user_id: &str) -> Message {
        let mut message =
            Message::new_local(cid(), user_id, "from server", vec![], chrono::Utc::now());
        message.id = id.into();
        message.sync_status = SyncStatus::Completed;
        message.created_at = Some(chrono::Utc::now());
        message
    }

    #[tokio::test]
    async fn connected_establishes_the_session() {
        let h = harness();
        h.dispatcher
            .dispatch(TransportEvent::Connected {
                connection_id: "conn-1".into(),
                me: me(),
            })
            .await
            .unwrap();

        assert_eq!(h.store.current_user_id().as_deref(), Some("me-user"));
        assert!(h.store.select_sync_state("me-user").unwrap().is_some());
        assert!(h.status_rx.borrow().is_online());
    }

    #[tokio::test]
    async fn new_message_reaches_store_and_live_state() {
        let h = harness();
        h.dispatcher
            .dispatch(TransportEvent::Connected {
                connection_id: "conn-1".into(),
                me: me(),
            })
            .await
            .unwrap();

        let channel = h.registry.channel("messaging", "general");
        h.dispatcher
            .dispatch(TransportEvent::MessageNew {
                cid: cid(),
                message: server_message("m1", "other-user"),
            })
            .await
            .unwrap();

        assert!(h.store.select_message("m1").unwrap().is_some());
        assert!(channel.state().message("m1").is_some());
        assert_eq!(*channel.state().unread_count().borrow(), 1);
    }

    #[tokio::test]
    async fn messages_for_inactive_channels_still_reach_the_mirror() {
        let h = harness();
        h.dispatcher
            .dispatch(TransportEvent::MessageNew {
                cid: cid(),
                message: server_message("m1", "other-user"),
            })
            .await
            .unwrap();

        assert!(h.store.select_message("m1").unwrap().is_some());
        assert!(h.registry.active_channels().is_empty());
    }

    #[tokio::test]
    async fn disconnect_flags_active_entities_for_recovery() {
        let h = harness();
        let channel = h.registry.channel("messaging", "general");
        channel.state().set_recovery_needed(false);

        h.dispatcher
            .dispatch(TransportEvent::Disconnected { reason: None })
            .await
            .unwrap();

        assert!(channel.state().recovery_needed());
        assert!(!h.status_rx.borrow().is_online());
    }

    #[tokio::test]
    async fn poll_sub_event_updates_the_stored_parent_without_a_live_thread() {
        let h = harness();
        let mut parent = server_message("p1", "other-user");
        parent.poll = Some(Poll {
            id: "poll-1".into(),
            question: "?".into(),
            ..Default::default()
        });
        h.store.insert_message(parent).unwrap();

        h.dispatcher
            .dispatch(TransportEvent::PollVoteCast {
                cid: cid(),
                message_id: "p1".into(),
                poll_id: "poll-1".into(),
                vote: PollVote {
                    id: "v1".into(),
                    option_id: "o1".into(),
                    user_id: "u2".into(),
                },
            })
            .await
            .unwrap();

        let stored = h.store.select_message("p1").unwrap().unwrap();
        assert_eq!(stored.poll.unwrap().vote_counts["o1"], 1);
    }

    #[tokio::test]
    async fn read_event_clears_own_unread() {
        let h = harness();
        h.dispatcher
            .dispatch(TransportEvent::Connected {
                connection_id: "conn-1".into(),
                me: me(),
            })
            .await
            .unwrap();

        let channel = h.registry.channel("messaging", "general");
        h.dispatcher
            .dispatch(TransportEvent::MessageNew {
                cid: cid(),
                message: server_message("m1", "other-user"),
            })
            .await
            .unwrap();
        assert_eq!(*channel.state().unread_count().borrow(), 1);

        h.dispatcher
            .dispatch(TransportEvent::MessageRead {
                cid: cid(),
                user_id: "me-user".into(),
                last_read: chrono::Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(*channel.state().unread_count().borrow(), 0);
    }

    #[tokio::test]
    async fn second_connect_recovers_everything() {
        // observable through the recover-all flag: a query that is not
        // flagged still reruns on the second connect
        let h = harness();

        h.dispatcher
            .dispatch(TransportEvent::Connected {
                connection_id: "conn-1".into(),
                me: me(),
            })
            .await
            .unwrap();

        let query = h.registry.query(palaver_core::QueryChannelsSpec::new(
            palaver_core::FilterObject::eq("type", "messaging"),
            palaver_core::QuerySort::new(),
        ));
        query.state().set_recovery_needed(false);

        h.dispatcher
            .dispatch(TransportEvent::Connected {
                connection_id: "conn-2".into(),
                me: me(),
            })
            .await
            .unwrap();

        // recover_all made the unflagged query run; success clears the flag
        // and records the (empty) result set
        assert!(!query.recovery_needed());
        assert!(query.state().current_cids().is_empty());
    }
}
