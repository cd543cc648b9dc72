//! Channel-list and thread-list query logic.

use std::sync::Arc;

use tracing::{debug, warn};

use palaver_core::{Channel, Message, QueryChannelsPaginationRequest};
use palaver_store::ChatStore;
use palaver_transport::{QueryChannelsRequest, TransportHandle};

use crate::error::Result;
use crate::logic::persist_channel_snapshots;
use crate::state::{QueryChannelsState, QueryThreadsState};

/// Owns one [`QueryChannelsState`]: runs the saved query online, feeds the
/// results back into its live state, and persists the refreshed spec.
pub struct QueryChannelsLogic {
    state: Arc<QueryChannelsState>,
    store: ChatStore,
    transport: TransportHandle,
}

impl QueryChannelsLogic {
    pub(crate) fn new(
        state: Arc<QueryChannelsState>,
        store: ChatStore,
        transport: TransportHandle,
    ) -> Self {
        Self {
            state,
            store,
            transport,
        }
    }

    pub fn state(&self) -> &Arc<QueryChannelsState> {
        &self.state
    }

    pub fn recovery_needed(&self) -> bool {
        self.state.recovery_needed()
    }

    /// Serve the query from the local mirror: resolve the persisted spec to
    /// its channel rows.
    pub fn load_offline(&self) -> Result<Vec<Channel>> {
        let spec = self.state.spec();
        let persisted = self.store.select_query_spec(&spec.id)?;

        let cids = match persisted {
            Some(p) => p.cids,
            None => Vec::new(),
        };
        let channels = self.store.select_channels(&cids)?;
        self.state.update_spec_cids(cids);
        Ok(channels)
    }

    /// Re-run the query against the server and feed the results back into
    /// the live state.  On success the refreshed spec and channel snapshots
    /// are persisted and the recovery flag clears; on failure the flag is
    /// set so the next recovery pass picks this query up.
    pub async fn run_query_online(
        &self,
        pagination: QueryChannelsPaginationRequest,
    ) -> Result<Vec<Channel>> {
        let first_page = pagination.is_first_page();
        if first_page {
            self.state.set_loading(true);
        } else {
            self.state.set_loading_more(true);
        }

        let spec = self.state.spec();
        let request = QueryChannelsRequest {
            filter: spec.filter.clone(),
            sort: spec.sort.clone(),
            pagination,
        };

        let result = self.transport.query_channels(request).await;

        if first_page {
            self.state.set_loading(false);
        } else {
            self.state.set_loading_more(false);
        }

        match result {
            Ok(channels) => {
                debug!(
                    spec = %spec.id,
                    count = channels.len(),
                    "channel query refreshed online"
                );
                persist_channel_snapshots(&self.store, &channels)?;

                let page_cids: Vec<_> = channels.iter().map(|c| c.cid.clone()).collect();
                let cids = if first_page {
                    page_cids
                } else {
                    let mut cids = self.state.current_cids();
                    for cid in page_cids {
                        if !cids.contains(&cid) {
                            cids.push(cid);
                        }
                    }
                    cids
                };

                self.state.set_end_of_channels(channels.len() < pagination.limit);
                let spec = self.state.update_spec_cids(cids);
                self.store.insert_query_spec(spec)?;
                self.state.set_recovery_needed(false);
                Ok(channels)
            }
            Err(e) => {
                warn!(spec = %spec.id, error = %e, "channel query failed, flagged for recovery");
                self.state.set_recovery_needed(true);
                Err(e.into())
            }
        }
    }
}

/// State machine for a thread-listing request:
/// `idle -> loading -> {success | failure}`.  A request carrying a
/// continuation cursor sets `loading_more` and appends instead of replacing.
pub struct QueryThreadsLogic {
    state: Arc<QueryThreadsState>,
}

impl QueryThreadsLogic {
    pub(crate) fn new(state: Arc<QueryThreadsState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<QueryThreadsState> {
        &self.state
    }

    /// A listing request started.  Returns `false` when one is already in
    /// flight.
    pub fn on_request(&self, cursor: Option<&str>) -> bool {
        if self.state.is_loading() {
            return false;
        }
        self.state.set_last_error(None);
        if cursor.is_some() {
            self.state.set_loading_more(true);
        } else {
            self.state.set_loading(true);
        }
        true
    }

    /// The listing succeeded: replace (no cursor) or append (cursor), and
    /// record whether the end of the list was reached.
    pub fn on_success(&self, threads: Vec<Message>, cursor: Option<&str>, end_of_list: bool) {
        if cursor.is_some() {
            self.state.append_threads(threads);
            self.state.set_loading_more(false);
        } else {
            self.state.set_threads(threads);
            self.state.set_loading(false);
        }
        self.state.set_end_of_threads(end_of_list);
    }

    /// The listing failed: loading clears, the error is surfaced.
    pub fn on_failure(&self, error: &str) {
        self.state.set_loading(false);
        self.state.set_loading_more(false);
        self.state.set_last_error(Some(error.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use palaver_core::Cid;

    fn thread(id: &str) -> Message {
        let mut msg = Message::new_local(
            Cid::new("messaging", "general"),
            "u1",
            "parent",
            vec![],
            Utc.timestamp_opt(10, 0).unwrap(),
        );
        msg.id = id.into();
        msg
    }

    fn logic() -> QueryThreadsLogic {
        QueryThreadsLogic::new(Arc::new(QueryThreadsState::new()))
    }

    #[test]
    fn first_request_sets_loading() {
        let logic = logic();
        assert!(logic.on_request(None));
        assert!(*logic.state().loading().borrow());
        assert!(!*logic.state().loading_more().borrow());
    }

    #[test]
    fn cursor_request_sets_loading_more() {
        let logic = logic();
        assert!(logic.on_request(Some("next-page")));
        assert!(*logic.state().loading_more().borrow());
        assert!(!*logic.state().loading().borrow());
    }

    #[test]
    fn concurrent_request_is_rejected() {
        let logic = logic();
        assert!(logic.on_request(None));
        assert!(!logic.on_request(None));
    }

    #[test]
    fn success_without_cursor_replaces() {
        let logic = logic();
        logic.on_request(None);
        logic.on_success(vec![thread("t1"), thread("t2")], None, false);

        logic.on_request(None);
        logic.on_success(vec![thread("t3")], None, true);

        let threads = logic.state().current_threads();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].id, "t3");
        assert!(*logic.state().end_of_threads().borrow());
        assert!(!*logic.state().loading().borrow());
    }

    #[test]
    fn success_with_cursor_appends_and_dedups() {
        let logic = logic();
        logic.on_request(None);
        logic.on_success(vec![thread("t1"), thread("t2")], None, false);

        logic.on_request(Some("cursor"));
        logic.on_success(vec![thread("t2"), thread("t3")], Some("cursor"), true);

        let ids: Vec<String> = logic
            .state()
            .current_threads()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, ["t1", "t2", "t3"]);
    }

    #[test]
    fn failure_clears_loading_and_surfaces_error() {
        let logic = logic();
        logic.on_request(None);
        logic.on_failure("network unreachable");

        assert!(!*logic.state().loading().borrow());
        assert_eq!(
            logic.state().last_error().borrow().as_deref(),
            Some("network unreachable")
        );
        // a new request may start again
        assert!(logic.on_request(None));
    }
}
