//! Recovery after reconnect.
//!
//! [`SyncManager::connection_recovered`] runs the bounded, best-effort
//! reconciliation pass: retry locally-queued entities (channels before the
//! messages that reference them, then reactions), re-run flagged live
//! queries, batch-refresh the remaining live channels, and persist the
//! recovery checkpoint.  A mutex serializes passes; per-entity failures are
//! recorded on the entity and never abort the batch.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use palaver_core::{
    Channel, Cid, ConnectionStatus, FilterObject, Message, QueryChannelsPaginationRequest,
    QuerySort, SyncState, SyncStatus,
};
use palaver_store::ChatStore;
use palaver_transport::{QueryChannelsRequest, TransportError, TransportHandle};

use crate::error::Result;
use crate::logic::persist_channel_snapshots;
use crate::registry::ActiveEntities;
use crate::uploader::AttachmentUploader;

/// Upper bound on live queries re-run per recovery pass.
const QUERIES_TO_RETRY: usize = 3;

/// Upper bound on live channels refreshed per recovery pass.
const CHANNELS_TO_RETRY: usize = 30;

/// Orchestrates reconciliation of local and remote state.
pub struct SyncManager {
    store: ChatStore,
    transport: TransportHandle,
    registry: Arc<ActiveEntities>,
    uploader: Arc<AttachmentUploader>,
    status: watch::Receiver<ConnectionStatus>,
    /// At most one retry pass runs at a time per session; a second trigger
    /// waits here instead of running concurrently.
    retry_mutex: Mutex<()>,
}

impl SyncManager {
    pub fn new(
        store: ChatStore,
        transport: TransportHandle,
        registry: Arc<ActiveEntities>,
        uploader: Arc<AttachmentUploader>,
        status: watch::Receiver<ConnectionStatus>,
    ) -> Self {
        Self {
            store,
            transport,
            registry,
            uploader,
            status,
            retry_mutex: Mutex::new(()),
        }
    }

    fn is_online(&self) -> bool {
        self.status.borrow().is_online()
    }

    /// Entry point, invoked on reconnect or periodic health check.  Steps
    /// are strictly ordered and each is gated on being online; the whole
    /// pass is best-effort and re-runs on the next trigger.
    pub async fn connection_recovered(&self, recover_all: bool) -> Result<()> {
        info!(recover_all, "starting recovery pass");

        if self.is_online() {
            self.retry_failed_entities().await?;
        }

        let refreshed = if self.is_online() {
            self.update_active_queries(recover_all).await?
        } else {
            HashSet::new()
        };

        if self.is_online() {
            self.update_active_channels(recover_all, &refreshed).await?;
        }

        if self.is_online() {
            self.persist_sync_state()?;
        }

        info!("recovery pass finished");
        Ok(())
    }

    /// Retry locally-queued entities under the retry mutex.  Channels go
    /// first: they must exist remotely before messages referencing them can
    /// be sent.  Reactions go last, after their messages.
    pub async fn retry_failed_entities(&self) -> Result<()> {
        let _guard = self.retry_mutex.lock().await;
        self.retry_channels().await?;
        self.retry_messages().await?;
        self.retry_reactions().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Step 1: locally-queued entities
    // ------------------------------------------------------------------

    async fn retry_channels(&self) -> Result<()> {
        let pending = self
            .store
            .select_channels_by_sync_status(SyncStatus::SyncNeeded)?;
        if pending.is_empty() {
            return Ok(());
        }
        info!(count = pending.len(), "retrying channels");

        for mut channel in pending {
            channel.sync_status = SyncStatus::InProgress;
            self.store.insert_channel(channel.clone())?;

            match self.transport.create_channel(channel.clone()).await {
                Ok(mut remote) => {
                    remote.sync_status = SyncStatus::Completed;
                    persist_channel_snapshots(&self.store, std::slice::from_ref(&remote))?;
                    self.apply_channel_snapshot(&remote);
                    debug!(cid = %remote.cid, "channel synced");
                }
                Err(e) => {
                    channel.sync_status = failure_status(&e);
                    warn!(
                        cid = %channel.cid,
                        error = %e,
                        permanent = e.is_permanent(),
                        "channel retry failed"
                    );
                    self.store.insert_channel(channel)?;
                }
            }
        }
        Ok(())
    }

    /// Retry messages, oldest first.  Messages still waiting on attachment
    /// uploads are pushed through the upload pipeline first; it either
    /// promotes them to `SyncNeeded` or fails them permanently.
    async fn retry_messages(&self) -> Result<()> {
        let awaiting = self
            .store
            .select_messages_by_sync_status(SyncStatus::AwaitingAttachments)?;
        for message in awaiting {
            let Some(cid) = message.cid.clone() else {
                continue;
            };
            self.uploader.upload_for_message(&cid, &message.id).await?;
        }

        let pending = self
            .store
            .select_messages_by_sync_status(SyncStatus::SyncNeeded)?;
        if !pending.is_empty() {
            info!(count = pending.len(), "retrying messages");
        }
        for message in pending {
            self.retry_message(message).await?;
        }
        Ok(())
    }

    async fn retry_message(&self, mut message: Message) -> Result<()> {
        let Some(cid) = message.cid.clone() else {
            warn!(id = %message.id, "cannot retry a message without a channel");
            return Ok(());
        };

        message.sync_status = SyncStatus::InProgress;
        self.store.insert_message(message.clone())?;

        let result = if message.deleted_at.is_some() {
            self.transport.delete_message(message.id.clone()).await
        } else if message.created_at.is_some() {
            // confirmed once before: this retry carries an edit
            self.transport.update_message(message.clone()).await
        } else {
            self.transport.send_message(message.clone()).await
        };

        match result {
            Ok(mut remote) => {
                remote.sync_status = SyncStatus::Completed;
                if remote.cid.is_none() {
                    remote.cid = Some(cid.clone());
                }
                self.store.insert_message(remote.clone())?;
                if self.registry.is_channel_active(&cid) {
                    self.registry.channel_by_cid(&cid).upsert_message(remote);
                }
                debug!(id = %message.id, "message synced");
            }
            Err(e) => {
                message.sync_status = failure_status(&e);
                if e.is_permanent() {
                    message.updated_locally_at = Some(Utc::now());
                }
                warn!(
                    id = %message.id,
                    error = %e,
                    permanent = e.is_permanent(),
                    "message retry failed"
                );
                self.store.insert_message(message.clone())?;
                if self.registry.is_channel_active(&cid) {
                    self.registry.channel_by_cid(&cid).upsert_message(message);
                }
            }
        }
        Ok(())
    }

    async fn retry_reactions(&self) -> Result<()> {
        let pending = self
            .store
            .select_reactions_by_sync_status(SyncStatus::SyncNeeded)?;
        if !pending.is_empty() {
            info!(count = pending.len(), "retrying reactions");
        }

        for mut reaction in pending {
            reaction.sync_status = SyncStatus::InProgress;
            self.store.insert_reaction(reaction.clone())?;

            if reaction.deleted_at.is_some() {
                match self
                    .transport
                    .delete_reaction(
                        reaction.message_id.clone(),
                        reaction.user_id.clone(),
                        reaction.kind.clone(),
                    )
                    .await
                {
                    Ok(()) => {
                        // deletion confirmed; the tombstone row can go
                        self.store.delete_reaction(
                            &reaction.message_id,
                            &reaction.user_id,
                            &reaction.kind,
                        )?;
                    }
                    Err(e) => {
                        reaction.sync_status = failure_status(&e);
                        warn!(message_id = %reaction.message_id, error = %e, "reaction deletion retry failed");
                        self.store.insert_reaction(reaction)?;
                    }
                }
            } else {
                match self.transport.send_reaction(reaction.clone()).await {
                    Ok(mut remote) => {
                        remote.sync_status = SyncStatus::Completed;
                        self.store.insert_reaction(remote)?;
                    }
                    Err(e) => {
                        reaction.sync_status = failure_status(&e);
                        warn!(message_id = %reaction.message_id, error = %e, "reaction retry failed");
                        self.store.insert_reaction(reaction)?;
                    }
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Steps 2-3: live queries and channels
    // ------------------------------------------------------------------

    /// Re-run flagged live queries online (all of them when `recover_all`),
    /// capped per pass.  Returns the cids refreshed along the way so step 3
    /// can skip them.
    async fn update_active_queries(&self, recover_all: bool) -> Result<HashSet<Cid>> {
        let queries: Vec<_> = self
            .registry
            .active_queries()
            .into_iter()
            .filter(|q| q.recovery_needed() || recover_all)
            .take(QUERIES_TO_RETRY)
            .collect();

        let mut refreshed = HashSet::new();
        for query in queries {
            let pagination = QueryChannelsPaginationRequest::new(0, 30).with_message_limit(30);
            match query.run_query_online(pagination).await {
                Ok(channels) => {
                    for channel in channels {
                        refreshed.insert(channel.cid.clone());
                        self.apply_channel_snapshot(&channel);
                    }
                }
                // isolated: a failed query never aborts the pass
                Err(e) => warn!(error = %e, "query recovery failed"),
            }
        }
        Ok(refreshed)
    }

    /// Batch-refresh live channels step 2 did not cover, capped per pass.
    /// A requested cid the server does not return is treated as not found
    /// remotely and re-created through a watch request.
    async fn update_active_channels(
        &self,
        recover_all: bool,
        refreshed: &HashSet<Cid>,
    ) -> Result<()> {
        let candidates: Vec<Cid> = self
            .registry
            .active_channels()
            .into_iter()
            .filter(|c| c.state().recovery_needed() || recover_all)
            .map(|c| c.state().cid().clone())
            .filter(|cid| !refreshed.contains(cid))
            .take(CHANNELS_TO_RETRY)
            .collect();

        if candidates.is_empty() {
            return Ok(());
        }
        debug!(count = candidates.len(), "refreshing active channels");

        let request = QueryChannelsRequest {
            filter: FilterObject::in_list("cid", candidates.iter().map(|c| c.to_string())),
            sort: QuerySort::new(),
            pagination: QueryChannelsPaginationRequest::new(0, candidates.len())
                .with_message_limit(30),
        };

        let channels = match self.transport.query_channels(request).await {
            Ok(channels) => channels,
            Err(e) => {
                warn!(error = %e, "active channel refresh failed");
                return Ok(());
            }
        };

        persist_channel_snapshots(&self.store, &channels)?;
        let returned: HashSet<Cid> = channels.iter().map(|c| c.cid.clone()).collect();
        for channel in &channels {
            self.apply_channel_snapshot(channel);
        }

        for cid in candidates.iter().filter(|cid| !returned.contains(cid)) {
            info!(cid = %cid, "channel missing remotely, re-creating via watch");
            match self.transport.watch_channel(cid.clone()).await {
                Ok(channel) => {
                    persist_channel_snapshots(&self.store, std::slice::from_ref(&channel))?;
                    self.apply_channel_snapshot(&channel);
                }
                Err(e) => warn!(cid = %cid, error = %e, "re-watch failed"),
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Step 4: checkpoint
    // ------------------------------------------------------------------

    fn persist_sync_state(&self) -> Result<()> {
        let Some(user_id) = self.store.current_user_id() else {
            return Ok(());
        };
        let state = SyncState {
            user_id,
            active_cids: self.registry.active_cids(),
            last_synced_at: Some(Utc::now()),
        };
        self.store.insert_sync_state(state)?;
        Ok(())
    }

    fn apply_channel_snapshot(&self, channel: &Channel) {
        if self.registry.is_channel_active(&channel.cid) {
            self.registry.channel_by_cid(&channel.cid).hydrate(channel);
        }
    }
}

/// Post-failure status per the error taxonomy: permanent errors are
/// terminal, transient ones re-queue the entity.
pub(crate) fn failure_status(error: &TransportError) -> SyncStatus {
    if error.is_permanent() {
        SyncStatus::FailedPermanently
    } else {
        SyncStatus::SyncNeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use palaver_core::QueryChannelsSpec;
    use palaver_store::Database;
    use palaver_transport::{ErrorKind, TransportCommand};

    struct Harness {
        sync: SyncManager,
        store: ChatStore,
        registry: Arc<ActiveEntities>,
        _status_tx: watch::Sender<ConnectionStatus>,
    }

    fn harness(cmd_buffer: usize) -> (Harness, tokio::sync::mpsc::Receiver<TransportCommand>) {
        let store = ChatStore::new(Database::open_in_memory().unwrap());
        store.set_current_user_id("me-user");
        let (transport, cmd_rx) = TransportHandle::channel(cmd_buffer);
        let registry = Arc::new(ActiveEntities::new(store.clone(), transport.clone()));
        let uploader = Arc::new(AttachmentUploader::new(store.clone(), transport.clone()));
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connected);
        let sync = SyncManager::new(
            store.clone(),
            transport,
            registry.clone(),
            uploader,
            status_rx,
        );
        (
            Harness {
                sync,
                store,
                registry,
                _status_tx: status_tx,
            },
            cmd_rx,
        )
    }

    fn cid() -> Cid {
        Cid::new("messaging", "general")
    }

    fn pending_message(store: &ChatStore, id: &str, secs: i64) -> Message {
        use chrono::TimeZone;
        let mut message = Message::new_local(
            cid(),
            "me-user",
            "queued",
            vec![],
            chrono::Utc.timestamp_opt(secs, 0).unwrap(),
        );
        message.id = id.into();
        store.insert_message(message.clone()).unwrap();
        message
    }

    /// Serve every command successfully; spawn per command so overlapping
    /// engine calls would overlap here too.  Tracks send order, call count
    /// and the maximum concurrency observed.
    fn serve_ok(
        mut cmd_rx: tokio::sync::mpsc::Receiver<TransportCommand>,
        sends: Arc<AtomicUsize>,
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
    ) {
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                let sends = sends.clone();
                let active = active.clone();
                let max_active = max_active.clone();
                tokio::spawn(async move {
                    match cmd {
                        TransportCommand::SendMessage { mut message, reply } => {
                            sends.fetch_add(1, Ordering::SeqCst);
                            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                            max_active.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            active.fetch_sub(1, Ordering::SeqCst);

                            message.sync_status = SyncStatus::Completed;
                            message.created_at = Some(Utc::now());
                            let _ = reply.send(Ok(message));
                        }
                        TransportCommand::CreateChannel { mut channel, reply } => {
                            channel.sync_status = SyncStatus::Completed;
                            let _ = reply.send(Ok(channel));
                        }
                        TransportCommand::SendReaction { mut reaction, reply } => {
                            reaction.sync_status = SyncStatus::Completed;
                            let _ = reply.send(Ok(reaction));
                        }
                        TransportCommand::QueryChannels { reply, .. } => {
                            let _ = reply.send(Ok(vec![]));
                        }
                        TransportCommand::WatchChannel { cid, reply } => {
                            let _ = reply.send(Ok(Channel::new(cid)));
                        }
                        _ => {}
                    }
                });
            }
        });
    }

    #[tokio::test]
    async fn retry_drains_exactly_once() {
        let (h, cmd_rx) = harness(32);
        serve_ok(
            cmd_rx,
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
        );

        for (id, secs) in [("m1", 10), ("m2", 20), ("m3", 30)] {
            pending_message(&h.store, id, secs);
        }

        h.sync.retry_failed_entities().await.unwrap();

        assert!(h
            .store
            .select_messages_by_sync_status(SyncStatus::SyncNeeded)
            .unwrap()
            .is_empty());
        for id in ["m1", "m2", "m3"] {
            let message = h.store.select_message(id).unwrap().unwrap();
            assert_eq!(message.sync_status, SyncStatus::Completed);
        }
    }

    #[tokio::test]
    async fn concurrent_recovery_passes_are_mutually_exclusive() {
        let (h, cmd_rx) = harness(32);
        let sends = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        serve_ok(cmd_rx, sends.clone(), active.clone(), max_active.clone());

        pending_message(&h.store, "m1", 10);
        pending_message(&h.store, "m2", 20);

        let (a, b) = tokio::join!(
            h.sync.connection_recovered(false),
            h.sync.connection_recovered(false),
        );
        a.unwrap();
        b.unwrap();

        // no overlapping sends, and no message was sent twice
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert_eq!(sends.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_errors_stop_retries() {
        let (h, mut cmd_rx) = harness(32);
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_srv = attempts.clone();
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                if let TransportCommand::SendMessage { reply, .. } = cmd {
                    attempts_srv.fetch_add(1, Ordering::SeqCst);
                    let _ = reply.send(Err(TransportError::new(
                        ErrorKind::Validation,
                        "rejected",
                    )));
                }
            }
        });

        pending_message(&h.store, "m1", 10);

        h.sync.retry_failed_entities().await.unwrap();
        let message = h.store.select_message("m1").unwrap().unwrap();
        assert_eq!(message.sync_status, SyncStatus::FailedPermanently);

        // a second pass finds nothing to retry
        h.sync.retry_failed_entities().await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_errors_keep_the_entity_queued() {
        let (h, mut cmd_rx) = harness(32);
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                if let TransportCommand::SendMessage { reply, .. } = cmd {
                    let _ = reply.send(Err(TransportError::new(
                        ErrorKind::Timeout,
                        "slow network",
                    )));
                }
            }
        });

        pending_message(&h.store, "m1", 10);
        h.sync.retry_failed_entities().await.unwrap();

        let message = h.store.select_message("m1").unwrap().unwrap();
        assert_eq!(message.sync_status, SyncStatus::SyncNeeded);
    }

    #[tokio::test]
    async fn channels_are_retried_before_messages() {
        let (h, mut cmd_rx) = harness(32);
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let order_srv = order.clone();
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    TransportCommand::CreateChannel { mut channel, reply } => {
                        order_srv.lock().push("channel");
                        channel.sync_status = SyncStatus::Completed;
                        let _ = reply.send(Ok(channel));
                    }
                    TransportCommand::SendMessage { mut message, reply } => {
                        order_srv.lock().push("message");
                        message.sync_status = SyncStatus::Completed;
                        let _ = reply.send(Ok(message));
                    }
                    _ => {}
                }
            }
        });

        let mut channel = Channel::new(cid());
        channel.sync_status = SyncStatus::SyncNeeded;
        h.store.insert_channel(channel).unwrap();
        pending_message(&h.store, "m1", 10);

        h.sync.retry_failed_entities().await.unwrap();
        assert_eq!(*order.lock(), ["channel", "message"]);
    }

    #[tokio::test]
    async fn missing_channels_are_recreated_via_watch() {
        let (h, mut cmd_rx) = harness(32);
        let watched = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let watched_srv = watched.clone();
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    TransportCommand::QueryChannels { reply, .. } => {
                        // the server knows none of the requested channels
                        let _ = reply.send(Ok(vec![]));
                    }
                    TransportCommand::WatchChannel { cid, reply } => {
                        watched_srv.lock().push(cid.to_string());
                        let mut channel = Channel::new(cid);
                        channel.name = "#recreated".into();
                        let _ = reply.send(Ok(channel));
                    }
                    _ => {}
                }
            }
        });

        let logic = h.registry.channel("messaging", "general");
        assert!(logic.state().recovery_needed());

        h.sync.connection_recovered(false).await.unwrap();

        assert_eq!(*watched.lock(), ["messaging:general"]);
        assert!(!logic.state().recovery_needed());
        let data = logic.state().channel_data().borrow().clone().unwrap();
        assert_eq!(data.name, "#recreated");
    }

    #[tokio::test]
    async fn queries_per_pass_are_capped() {
        let (h, mut cmd_rx) = harness(64);
        let query_calls = Arc::new(AtomicUsize::new(0));
        let query_calls_srv = query_calls.clone();
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                if let TransportCommand::QueryChannels { reply, .. } = cmd {
                    query_calls_srv.fetch_add(1, Ordering::SeqCst);
                    let _ = reply.send(Ok(vec![]));
                }
            }
        });

        for i in 0..5 {
            h.registry.query(QueryChannelsSpec::new(
                FilterObject::eq("type", format!("kind-{i}")),
                QuerySort::new(),
            ));
        }

        h.sync.connection_recovered(true).await.unwrap();
        assert_eq!(query_calls.load(Ordering::SeqCst), QUERIES_TO_RETRY);
    }

    #[tokio::test]
    async fn recovery_pass_persists_the_checkpoint() {
        let (h, cmd_rx) = harness(32);
        serve_ok(
            cmd_rx,
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
        );

        h.registry.channel("messaging", "general");
        h.sync.connection_recovered(false).await.unwrap();

        let state = h.store.select_sync_state("me-user").unwrap().unwrap();
        assert_eq!(state.active_cids, vec![cid()]);
        assert!(state.last_synced_at.is_some());
    }
}
