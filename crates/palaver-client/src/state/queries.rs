//! Observable state of channel-list and thread-list queries.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;

use palaver_core::{Cid, Message, QueryChannelsSpec};

/// Reactive state of one saved channel-list query.
pub struct QueryChannelsState {
    spec: parking_lot::Mutex<QueryChannelsSpec>,
    cids: watch::Sender<Vec<Cid>>,
    loading: watch::Sender<bool>,
    loading_more: watch::Sender<bool>,
    end_of_channels: watch::Sender<bool>,
    recovery_needed: AtomicBool,
}

impl QueryChannelsState {
    pub(crate) fn new(spec: QueryChannelsSpec) -> Self {
        Self {
            spec: parking_lot::Mutex::new(spec),
            cids: watch::channel(Vec::new()).0,
            loading: watch::channel(false).0,
            loading_more: watch::channel(false).0,
            end_of_channels: watch::channel(false).0,
            recovery_needed: AtomicBool::new(true),
        }
    }

    pub fn spec(&self) -> QueryChannelsSpec {
        self.spec.lock().clone()
    }

    pub fn spec_id(&self) -> String {
        self.spec.lock().id.clone()
    }

    pub fn cids(&self) -> watch::Receiver<Vec<Cid>> {
        self.cids.subscribe()
    }

    pub fn current_cids(&self) -> Vec<Cid> {
        self.cids.borrow().clone()
    }

    pub fn loading(&self) -> watch::Receiver<bool> {
        self.loading.subscribe()
    }

    pub fn loading_more(&self) -> watch::Receiver<bool> {
        self.loading_more.subscribe()
    }

    pub fn end_of_channels(&self) -> watch::Receiver<bool> {
        self.end_of_channels.subscribe()
    }

    pub fn recovery_needed(&self) -> bool {
        self.recovery_needed.load(Ordering::SeqCst)
    }

    pub(crate) fn update_spec_cids(&self, cids: Vec<Cid>) -> QueryChannelsSpec {
        let mut spec = self.spec.lock();
        spec.cids = cids.clone();
        self.cids.send_replace(cids);
        spec.clone()
    }

    pub(crate) fn set_loading(&self, value: bool) {
        self.loading.send_replace(value);
    }

    pub(crate) fn set_loading_more(&self, value: bool) {
        self.loading_more.send_replace(value);
    }

    pub(crate) fn set_end_of_channels(&self, value: bool) {
        self.end_of_channels.send_replace(value);
    }

    pub(crate) fn set_recovery_needed(&self, value: bool) {
        self.recovery_needed.store(value, Ordering::SeqCst);
    }
}

/// Reactive state of a thread-listing query:
/// `idle -> loading -> {success | failure}`, where a request carrying a
/// continuation cursor loads more instead of replacing.
pub struct QueryThreadsState {
    threads: watch::Sender<Vec<Message>>,
    loading: watch::Sender<bool>,
    loading_more: watch::Sender<bool>,
    end_of_threads: watch::Sender<bool>,
    last_error: watch::Sender<Option<String>>,
}

impl QueryThreadsState {
    pub(crate) fn new() -> Self {
        Self {
            threads: watch::channel(Vec::new()).0,
            loading: watch::channel(false).0,
            loading_more: watch::channel(false).0,
            end_of_threads: watch::channel(false).0,
            last_error: watch::channel(None).0,
        }
    }

    pub fn threads(&self) -> watch::Receiver<Vec<Message>> {
        self.threads.subscribe()
    }

    pub fn current_threads(&self) -> Vec<Message> {
        self.threads.borrow().clone()
    }

    pub fn loading(&self) -> watch::Receiver<bool> {
        self.loading.subscribe()
    }

    pub fn loading_more(&self) -> watch::Receiver<bool> {
        self.loading_more.subscribe()
    }

    pub fn end_of_threads(&self) -> watch::Receiver<bool> {
        self.end_of_threads.subscribe()
    }

    pub fn last_error(&self) -> watch::Receiver<Option<String>> {
        self.last_error.subscribe()
    }

    pub fn is_loading(&self) -> bool {
        *self.loading.borrow() || *self.loading_more.borrow()
    }

    pub(crate) fn set_threads(&self, threads: Vec<Message>) {
        self.threads.send_replace(threads);
    }

    pub(crate) fn append_threads(&self, new_threads: Vec<Message>) {
        self.threads.send_modify(|threads| {
            for thread in new_threads {
                if let Some(existing) = threads.iter_mut().find(|t| t.id == thread.id) {
                    *existing = thread;
                } else {
                    threads.push(thread);
                }
            }
        });
    }

    pub(crate) fn set_loading(&self, value: bool) {
        self.loading.send_replace(value);
    }

    pub(crate) fn set_loading_more(&self, value: bool) {
        self.loading_more.send_replace(value);
    }

    pub(crate) fn set_end_of_threads(&self, value: bool) {
        self.end_of_threads.send_replace(value);
    }

    pub(crate) fn set_last_error(&self, error: Option<String>) {
        self.last_error.send_replace(error);
    }
}

impl Default for QueryThreadsState {
    fn default() -> Self {
        Self::new()
    }
}
