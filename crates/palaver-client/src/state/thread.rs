//! Observable state of one live thread.

use std::collections::HashMap;

use tokio::sync::watch;

use palaver_core::Message;

/// Reactive state of a thread: the parent message and the reply map.
/// Replies are referenced here, owned by the channel named in their `cid`.
pub struct ThreadState {
    parent_id: String,
    parent: watch::Sender<Option<Message>>,
    replies: watch::Sender<HashMap<String, Message>>,
    loading: watch::Sender<bool>,
    end_of_older_replies: watch::Sender<bool>,
}

impl ThreadState {
    pub(crate) fn new(parent_id: impl Into<String>) -> Self {
        Self {
            parent_id: parent_id.into(),
            parent: watch::channel(None).0,
            replies: watch::channel(HashMap::new()).0,
            loading: watch::channel(false).0,
            end_of_older_replies: watch::channel(false).0,
        }
    }

    pub fn parent_id(&self) -> &str {
        &self.parent_id
    }

    pub fn parent(&self) -> watch::Receiver<Option<Message>> {
        self.parent.subscribe()
    }

    pub fn parent_message(&self) -> Option<Message> {
        self.parent.borrow().clone()
    }

    pub fn replies(&self) -> watch::Receiver<HashMap<String, Message>> {
        self.replies.subscribe()
    }

    /// Current replies ascending by creation time.
    pub fn sorted_replies(&self) -> Vec<Message> {
        let mut replies: Vec<Message> = self.replies.borrow().values().cloned().collect();
        replies.sort_by(|a, b| {
            a.created_time()
                .cmp(&b.created_time())
                .then_with(|| a.id.cmp(&b.id))
        });
        replies
    }

    pub fn loading(&self) -> watch::Receiver<bool> {
        self.loading.subscribe()
    }

    pub fn end_of_older_replies(&self) -> watch::Receiver<bool> {
        self.end_of_older_replies.subscribe()
    }

    pub(crate) fn set_parent(&self, parent: Option<Message>) {
        self.parent.send_replace(parent);
    }

    pub(crate) fn modify_parent(&self, f: impl FnOnce(&mut Option<Message>)) {
        self.parent.send_modify(f);
    }

    pub(crate) fn modify_replies(&self, f: impl FnOnce(&mut HashMap<String, Message>)) {
        self.replies.send_modify(f);
    }

    pub(crate) fn set_loading(&self, value: bool) {
        self.loading.send_replace(value);
    }

    pub(crate) fn set_end_of_older_replies(&self, value: bool) {
        self.end_of_older_replies.send_replace(value);
    }
}
