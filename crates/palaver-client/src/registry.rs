//! Registry of live channels, threads and queries.
//!
//! Lazily creates and memoizes one state+logic instance per identity;
//! repeated lookups return the same live instance.  This registry is the
//! single source of truth for what the sync manager attempts to recover.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use palaver_core::{Cid, QueryChannelsSpec};
use palaver_store::ChatStore;
use palaver_transport::TransportHandle;

use crate::logic::{ChannelLogic, QueryChannelsLogic, ThreadLogic};
use crate::state::{ChannelState, QueryChannelsState, ThreadState};

/// Maps channel/query/thread identities to their live state+logic pairs.
pub struct ActiveEntities {
    store: ChatStore,
    transport: TransportHandle,
    channels: Mutex<HashMap<Cid, Arc<ChannelLogic>>>,
    threads: Mutex<HashMap<String, Arc<ThreadLogic>>>,
    queries: Mutex<HashMap<String, Arc<QueryChannelsLogic>>>,
}

impl ActiveEntities {
    pub fn new(store: ChatStore, transport: TransportHandle) -> Self {
        Self {
            store,
            transport,
            channels: Mutex::new(HashMap::new()),
            threads: Mutex::new(HashMap::new()),
            queries: Mutex::new(HashMap::new()),
        }
    }

    /// Live instance for `type:id`; idempotent, repeated calls with the same
    /// identity return the same instance.
    pub fn channel(&self, channel_type: &str, channel_id: &str) -> Arc<ChannelLogic> {
        self.channel_by_cid(&Cid::new(channel_type, channel_id))
    }

    pub fn channel_by_cid(&self, cid: &Cid) -> Arc<ChannelLogic> {
        let mut channels = self.channels.lock();
        channels
            .entry(cid.clone())
            .or_insert_with(|| {
                debug!(cid = %cid, "activating channel");
                Arc::new(ChannelLogic::new(
                    Arc::new(ChannelState::new(cid.clone())),
                    self.store.clone(),
                ))
            })
            .clone()
    }

    /// Live thread instance for a parent message id.
    pub fn thread(&self, parent_id: &str) -> Arc<ThreadLogic> {
        let mut threads = self.threads.lock();
        threads
            .entry(parent_id.to_string())
            .or_insert_with(|| {
                debug!(parent_id, "activating thread");
                Arc::new(ThreadLogic::new(
                    Arc::new(ThreadState::new(parent_id)),
                    self.store.clone(),
                ))
            })
            .clone()
    }

    /// Live instance for a saved query; memoized by the deterministic spec
    /// id, so semantically identical queries share one instance.
    pub fn query(&self, spec: QueryChannelsSpec) -> Arc<QueryChannelsLogic> {
        let mut queries = self.queries.lock();
        queries
            .entry(spec.id.clone())
            .or_insert_with(|| {
                debug!(spec = %spec.id, "activating query");
                Arc::new(QueryChannelsLogic::new(
                    Arc::new(QueryChannelsState::new(spec)),
                    self.store.clone(),
                    self.transport.clone(),
                ))
            })
            .clone()
    }

    pub fn is_channel_active(&self, cid: &Cid) -> bool {
        self.channels.lock().contains_key(cid)
    }

    /// The live channel instance, without activating one.
    pub fn channel_if_active(&self, cid: &Cid) -> Option<Arc<ChannelLogic>> {
        self.channels.lock().get(cid).cloned()
    }

    /// The live thread instance, without activating one.
    pub fn thread_if_active(&self, parent_id: &str) -> Option<Arc<ThreadLogic>> {
        self.threads.lock().get(parent_id).cloned()
    }

    /// Snapshot of every live channel.
    pub fn active_channels(&self) -> Vec<Arc<ChannelLogic>> {
        self.channels.lock().values().cloned().collect()
    }

    /// Snapshot of every live query.
    pub fn active_queries(&self) -> Vec<Arc<QueryChannelsLogic>> {
        self.queries.lock().values().cloned().collect()
    }

    /// Cids of every live channel, sorted for deterministic persistence.
    pub fn active_cids(&self) -> Vec<Cid> {
        let mut cids: Vec<Cid> = self.channels.lock().keys().cloned().collect();
        cids.sort();
        cids
    }

    /// Flag every live channel and query for refresh on the next recovery
    /// pass (connectivity was lost).
    pub fn mark_all_recovery_needed(&self) {
        for channel in self.active_channels() {
            channel.state().set_recovery_needed(true);
        }
        for query in self.active_queries() {
            query.state().set_recovery_needed(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_core::{FilterObject, QuerySort};
    use palaver_store::Database;

    fn registry() -> ActiveEntities {
        let store = ChatStore::new(Database::open_in_memory().unwrap());
        let (transport, _rx) = TransportHandle::channel(8);
        ActiveEntities::new(store, transport)
    }

    #[test]
    fn channel_lookup_is_idempotent() {
        let registry = registry();
        let first = registry.channel("messaging", "general");
        let second = registry.channel("messaging", "general");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.active_channels().len(), 1);
    }

    #[test]
    fn distinct_identities_get_distinct_instances() {
        let registry = registry();
        let a = registry.channel("messaging", "general");
        let b = registry.channel("messaging", "random");
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn semantically_equal_queries_share_an_instance() {
        let registry = registry();
        let a = registry.query(QueryChannelsSpec::new(
            FilterObject::eq("type", "messaging"),
            QuerySort::new(),
        ));
        let b = registry.query(QueryChannelsSpec::new(
            FilterObject::eq("type", "messaging"),
            QuerySort::new(),
        ));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.active_queries().len(), 1);
    }

    #[test]
    fn mark_all_recovery_needed_reaches_every_instance() {
        let registry = registry();
        let channel = registry.channel("messaging", "general");
        channel.state().set_recovery_needed(false);

        registry.mark_all_recovery_needed();
        assert!(channel.state().recovery_needed());
    }
}
