//! Observable state of one live channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use palaver_core::{Channel, ChannelRead, Cid, Member, Message};

/// Reactive state of a channel: message map, member list, read markers and
/// the loading/pagination flags.  Only the owning [`crate::logic::ChannelLogic`]
/// writes; any number of readers subscribe.
pub struct ChannelState {
    cid: Cid,
    messages: watch::Sender<HashMap<String, Message>>,
    channel_data: watch::Sender<Option<Channel>>,
    members: watch::Sender<HashMap<String, Member>>,
    reads: watch::Sender<HashMap<String, ChannelRead>>,
    unread_count: watch::Sender<u64>,
    last_message_at: watch::Sender<Option<DateTime<Utc>>>,
    loading: watch::Sender<bool>,
    loading_older: watch::Sender<bool>,
    end_of_older_messages: watch::Sender<bool>,
    end_of_newer_messages: watch::Sender<bool>,
    /// Whether this channel must be refreshed on the next recovery pass.
    /// Set on creation and on disconnect, cleared by a successful hydrate.
    recovery_needed: AtomicBool,
}

impl ChannelState {
    pub(crate) fn new(cid: Cid) -> Self {
        Self {
            cid,
            messages: watch::channel(HashMap::new()).0,
            channel_data: watch::channel(None).0,
            members: watch::channel(HashMap::new()).0,
            reads: watch::channel(HashMap::new()).0,
            unread_count: watch::channel(0).0,
            last_message_at: watch::channel(None).0,
            loading: watch::channel(false).0,
            loading_older: watch::channel(false).0,
            end_of_older_messages: watch::channel(false).0,
            end_of_newer_messages: watch::channel(false).0,
            recovery_needed: AtomicBool::new(true),
        }
    }

    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    // ------------------------------------------------------------------
    // Read side
    // ------------------------------------------------------------------

    pub fn messages(&self) -> watch::Receiver<HashMap<String, Message>> {
        self.messages.subscribe()
    }

    /// Current messages ascending by creation time.  The map construction
    /// guarantees no duplicate ids.
    pub fn sorted_messages(&self) -> Vec<Message> {
        let mut messages: Vec<Message> = self.messages.borrow().values().cloned().collect();
        messages.sort_by(|a, b| {
            a.created_time()
                .cmp(&b.created_time())
                .then_with(|| a.id.cmp(&b.id))
        });
        messages
    }

    /// Oldest message currently loaded, used as the backward-pagination
    /// anchor.
    pub fn oldest_message(&self) -> Option<Message> {
        self.sorted_messages().into_iter().next()
    }

    /// Newest message currently loaded.
    pub fn newest_message(&self) -> Option<Message> {
        self.sorted_messages().into_iter().last()
    }

    pub fn message(&self, id: &str) -> Option<Message> {
        self.messages.borrow().get(id).cloned()
    }

    pub fn channel_data(&self) -> watch::Receiver<Option<Channel>> {
        self.channel_data.subscribe()
    }

    pub fn members(&self) -> watch::Receiver<HashMap<String, Member>> {
        self.members.subscribe()
    }

    pub fn reads(&self) -> watch::Receiver<HashMap<String, ChannelRead>> {
        self.reads.subscribe()
    }

    pub fn unread_count(&self) -> watch::Receiver<u64> {
        self.unread_count.subscribe()
    }

    pub fn last_message_at(&self) -> watch::Receiver<Option<DateTime<Utc>>> {
        self.last_message_at.subscribe()
    }

    pub fn loading(&self) -> watch::Receiver<bool> {
        self.loading.subscribe()
    }

    pub fn loading_older(&self) -> watch::Receiver<bool> {
        self.loading_older.subscribe()
    }

    pub fn end_of_older_messages(&self) -> watch::Receiver<bool> {
        self.end_of_older_messages.subscribe()
    }

    pub fn end_of_newer_messages(&self) -> watch::Receiver<bool> {
        self.end_of_newer_messages.subscribe()
    }

    pub fn recovery_needed(&self) -> bool {
        self.recovery_needed.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Write side (owning logic only)
    // ------------------------------------------------------------------

    pub(crate) fn modify_messages(&self, f: impl FnOnce(&mut HashMap<String, Message>)) {
        self.messages.send_modify(f);
    }

    pub(crate) fn set_channel_data(&self, channel: Option<Channel>) {
        self.channel_data.send_replace(channel);
    }

    pub(crate) fn set_members(&self, members: HashMap<String, Member>) {
        self.members.send_replace(members);
    }

    pub(crate) fn modify_members(&self, f: impl FnOnce(&mut HashMap<String, Member>)) {
        self.members.send_modify(f);
    }

    pub(crate) fn set_reads(&self, reads: HashMap<String, ChannelRead>) {
        self.reads.send_replace(reads);
    }

    pub(crate) fn modify_reads(&self, f: impl FnOnce(&mut HashMap<String, ChannelRead>)) {
        self.reads.send_modify(f);
    }

    pub(crate) fn set_unread_count(&self, count: u64) {
        self.unread_count.send_replace(count);
    }

    pub(crate) fn set_last_message_at(&self, at: Option<DateTime<Utc>>) {
        self.last_message_at.send_replace(at);
    }

    /// Push `at` forward, never backward.
    pub(crate) fn advance_last_message_at(&self, at: DateTime<Utc>) {
        self.last_message_at.send_modify(|current| {
            if current.map_or(true, |c| c < at) {
                *current = Some(at);
            }
        });
    }

    pub(crate) fn set_loading(&self, value: bool) {
        self.loading.send_replace(value);
    }

    pub(crate) fn set_loading_older(&self, value: bool) {
        self.loading_older.send_replace(value);
    }

    pub(crate) fn set_end_of_older_messages(&self, value: bool) {
        self.end_of_older_messages.send_replace(value);
    }

    pub(crate) fn set_end_of_newer_messages(&self, value: bool) {
        self.end_of_newer_messages.send_replace(value);
    }

    pub(crate) fn set_recovery_needed(&self, value: bool) {
        self.recovery_needed.store(value, Ordering::SeqCst);
    }
}
