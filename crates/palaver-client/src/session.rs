//! The per-user session context.
//!
//! A [`ChatSession`] owns every component of the engine -- store, registry,
//! sync manager, upload worker, event loop -- and exposes the write surface
//! the UI layer drives (`send_message`, `watch_channel`, `query_channels`,
//! `load_older_messages`, reactions).  Reads happen through the observable
//! handles the registry returns.  Dropping the session aborts its background
//! work; on-disk state stays consistent because every write is a single
//! statement or transaction.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use palaver_core::{
    AnyChannelPaginationRequest, Attachment, Cid, ConnectionStatus, FilterObject, Message,
    Pagination, QueryChannelsPaginationRequest, QueryChannelsSpec, QuerySort, Reaction,
    SyncStatus,
};
use palaver_store::ChatStore;
use palaver_transport::{TransportEvent, TransportHandle};

use crate::error::{ChatError, Result};
use crate::events::{spawn_event_loop, EventDispatcher};
use crate::logic::{persist_channel_snapshots, ChannelLogic, QueryChannelsLogic, QueryThreadsLogic, ThreadLogic};
use crate::registry::ActiveEntities;
use crate::state::QueryThreadsState;
use crate::sync::{failure_status, SyncManager};
use crate::uploader::AttachmentUploader;

/// Immutable session configuration.  `with_*` constructors return a copy
/// differing in one field.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Messages loaded per channel page.
    pub message_page_size: usize,
    /// Channels requested per channel-list query page.
    pub channel_page_size: usize,
}

impl SessionConfig {
    pub fn with_message_page_size(self, message_page_size: usize) -> Self {
        Self {
            message_page_size,
            ..self
        }
    }

    pub fn with_channel_page_size(self, channel_page_size: usize) -> Self {
        Self {
            channel_page_size,
            ..self
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            message_page_size: 30,
            channel_page_size: 30,
        }
    }
}

/// One live user session.  All background work is scoped to its lifetime.
pub struct ChatSession {
    config: SessionConfig,
    store: ChatStore,
    transport: TransportHandle,
    registry: Arc<ActiveEntities>,
    sync: Arc<SyncManager>,
    uploader: Arc<AttachmentUploader>,
    status_rx: watch::Receiver<ConnectionStatus>,
    event_task: tokio::task::JoinHandle<()>,
}

impl ChatSession {
    /// Wire up a session over an opened store, a transport handle and the
    /// transport's decoded event stream.
    pub fn new(
        config: SessionConfig,
        store: ChatStore,
        transport: TransportHandle,
        event_rx: mpsc::Receiver<TransportEvent>,
    ) -> Self {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);

        let registry = Arc::new(ActiveEntities::new(store.clone(), transport.clone()));
        let uploader = Arc::new(AttachmentUploader::new(store.clone(), transport.clone()));
        let sync = Arc::new(SyncManager::new(
            store.clone(),
            transport.clone(),
            registry.clone(),
            uploader.clone(),
            status_rx.clone(),
        ));
        let dispatcher = Arc::new(EventDispatcher::new(
            store.clone(),
            registry.clone(),
            sync.clone(),
            status_tx,
        ));
        let event_task = spawn_event_loop(dispatcher, event_rx);

        info!("chat session started");
        Self {
            config,
            store,
            transport,
            registry,
            sync,
            uploader,
            status_rx,
            event_task,
        }
    }

    pub fn store(&self) -> &ChatStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ActiveEntities> {
        &self.registry
    }

    pub fn sync_manager(&self) -> &Arc<SyncManager> {
        &self.sync
    }

    pub fn connection_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    fn is_online(&self) -> bool {
        self.status_rx.borrow().is_online()
    }

    fn current_user_id(&self) -> Result<String> {
        self.store.current_user_id().ok_or(ChatError::NoCurrentUser)
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Create and send a message, optionally with local file attachments.
    ///
    /// The message is persisted and visible in channel state immediately.
    /// Attachments go through the upload pipeline first; the send happens
    /// online when possible, otherwise the message stays queued for the
    /// next recovery pass.  Transport failures are recorded on the message
    /// (its sync status is the terminal state), not returned as errors.
    pub async fn send_message(
        &self,
        cid: &Cid,
        text: &str,
        attachment_paths: Vec<PathBuf>,
    ) -> Result<Message> {
        let user_id = self.current_user_id()?;
        if text.trim().is_empty() && attachment_paths.is_empty() {
            return Err(ChatError::InvalidInput(
                "message needs text or attachments".into(),
            ));
        }

        let attachments: Vec<Attachment> = attachment_paths
            .into_iter()
            .map(Attachment::from_local_file)
            .collect();
        let mut message = Message::new_local(cid.clone(), user_id, text, attachments, Utc::now());

        self.store.insert_message(message.clone())?;
        let channel = self.registry.channel_by_cid(cid);
        channel.upsert_message(message.clone());

        if message.sync_status == SyncStatus::AwaitingAttachments {
            if let Some(done) = self.uploader.upload_for_message(cid, &message.id).await? {
                message = done;
                channel.upsert_message(message.clone());
            }
        }

        if message.sync_status == SyncStatus::SyncNeeded && self.is_online() {
            message = self.send_now(message).await?;
            channel.upsert_message(message.clone());
        }

        Ok(message)
    }

    async fn send_now(&self, mut message: Message) -> Result<Message> {
        message.sync_status = SyncStatus::InProgress;
        self.store.insert_message(message.clone())?;

        match self.transport.send_message(message.clone()).await {
            Ok(mut remote) => {
                remote.sync_status = SyncStatus::Completed;
                if remote.cid.is_none() {
                    remote.cid = message.cid.clone();
                }
                self.store.insert_message(remote.clone())?;
                Ok(remote)
            }
            Err(e) => {
                message.sync_status = failure_status(&e);
                if e.is_permanent() {
                    message.updated_locally_at = Some(Utc::now());
                }
                warn!(id = %message.id, error = %e, "send failed");
                self.store.insert_message(message.clone())?;
                Ok(message)
            }
        }
    }

    /// Load the previous page of a channel's history from the local mirror.
    pub async fn load_older_messages(&self, cid: &Cid, limit: usize) -> Result<Vec<Message>> {
        let channel = self.registry.channel_by_cid(cid);
        let state = channel.state();

        if *state.loading_older().borrow() {
            return Ok(Vec::new());
        }
        state.set_loading_older(true);

        let request = match state.oldest_message() {
            Some(oldest) => AnyChannelPaginationRequest::with_limit(limit)
                .with_cursor(Pagination::LessThan, oldest.id),
            None => AnyChannelPaginationRequest::with_limit(limit),
        };

        let result = self.store.select_messages_for_channel(cid, &request);
        state.set_loading_older(false);
        let page = result?;

        state.set_end_of_older_messages(page.len() < limit);
        channel.upsert_messages(page.clone());
        Ok(page)
    }

    // ------------------------------------------------------------------
    // Channels & queries
    // ------------------------------------------------------------------

    /// Activate a channel: hydrate from the local mirror, then refresh (and
    /// create remotely if needed) through a watch request when online.
    pub async fn watch_channel(
        &self,
        channel_type: &str,
        channel_id: &str,
    ) -> Result<Arc<ChannelLogic>> {
        let channel = self.registry.channel(channel_type, channel_id);
        let cid = channel.state().cid().clone();
        channel.state().set_loading(true);

        // serve reads instantly from the mirror
        if let Some(mut stored) = self.store.select_channel(&cid)? {
            stored.messages = self.store.select_messages_for_channel(
                &cid,
                &AnyChannelPaginationRequest::with_limit(self.config.message_page_size),
            )?;
            channel.hydrate(&stored);
            // offline data only; still needs a server refresh
            channel.state().set_recovery_needed(true);
        }

        if self.is_online() {
            match self.transport.watch_channel(cid.clone()).await {
                Ok(remote) => {
                    persist_channel_snapshots(&self.store, std::slice::from_ref(&remote))?;
                    channel.hydrate(&remote);
                }
                Err(e) => {
                    warn!(cid = %cid, error = %e, "watch failed, flagged for recovery");
                    channel.state().set_recovery_needed(true);
                }
            }
        }

        channel.state().set_loading(false);
        Ok(channel)
    }

    /// Run a channel-list query, offline-first: persisted results are served
    /// immediately, then refreshed online when connected.
    pub async fn query_channels(
        &self,
        filter: FilterObject,
        sort: QuerySort,
    ) -> Result<Arc<QueryChannelsLogic>> {
        let query = self
            .registry
            .query(QueryChannelsSpec::new(filter, sort));

        query.load_offline()?;

        if self.is_online() {
            let pagination = QueryChannelsPaginationRequest::new(0, self.config.channel_page_size)
                .with_message_limit(self.config.message_page_size);
            match query.run_query_online(pagination).await {
                Ok(channels) => {
                    for channel in &channels {
                        if self.registry.is_channel_active(&channel.cid) {
                            self.registry.channel_by_cid(&channel.cid).hydrate(channel);
                        }
                    }
                }
                // offline-first: the persisted result set stands, the query
                // is flagged and retried by the next recovery pass
                Err(e) => warn!(error = %e, "online query failed"),
            }
        }

        Ok(query)
    }

    // ------------------------------------------------------------------
    // Threads
    // ------------------------------------------------------------------

    /// Activate a thread and hydrate it from the local mirror.
    pub fn thread(&self, parent_id: &str) -> Result<Arc<ThreadLogic>> {
        let thread = self.registry.thread(parent_id);
        thread.hydrate_from_store()?;
        Ok(thread)
    }

    /// A fresh thread-listing state machine for the UI to drive.
    pub fn query_threads(&self) -> QueryThreadsLogic {
        QueryThreadsLogic::new(Arc::new(QueryThreadsState::new()))
    }

    // ------------------------------------------------------------------
    // Reactions
    // ------------------------------------------------------------------

    /// Add a reaction to a message, optimistically and queued for sync.
    pub async fn send_reaction(&self, message_id: &str, kind: &str) -> Result<Reaction> {
        let user_id = self.current_user_id()?;

        let mut reaction = Reaction::new(message_id, user_id, kind);
        reaction.created_at = Some(Utc::now());
        self.store.insert_reaction(reaction.clone())?;
        self.apply_reaction_to_message(message_id, kind, 1, &reaction)?;

        if self.is_online() {
            reaction.sync_status = SyncStatus::InProgress;
            self.store.insert_reaction(reaction.clone())?;
            match self.transport.send_reaction(reaction.clone()).await {
                Ok(mut remote) => {
                    remote.sync_status = SyncStatus::Completed;
                    self.store.insert_reaction(remote.clone())?;
                    reaction = remote;
                }
                Err(e) => {
                    reaction.sync_status = failure_status(&e);
                    warn!(message_id, error = %e, "reaction send failed");
                    self.store.insert_reaction(reaction.clone())?;
                }
            }
        }

        Ok(reaction)
    }

    /// Remove an own reaction: tombstoned locally, confirmed online when
    /// possible.
    pub async fn delete_reaction(&self, message_id: &str, kind: &str) -> Result<()> {
        let user_id = self.current_user_id()?;

        let Some(mut reaction) = self.store.select_reaction(message_id, &user_id, kind)? else {
            return Err(ChatError::InvalidInput(format!(
                "no `{kind}` reaction on `{message_id}` to delete"
            )));
        };
        reaction.deleted_at = Some(Utc::now());
        reaction.sync_status = SyncStatus::SyncNeeded;
        self.store.insert_reaction(reaction.clone())?;
        self.apply_reaction_to_message(message_id, kind, -1, &reaction)?;

        if self.is_online() {
            match self
                .transport
                .delete_reaction(message_id.to_string(), user_id, kind.to_string())
                .await
            {
                Ok(()) => {
                    self.store
                        .delete_reaction(message_id, &reaction.user_id, kind)?;
                }
                Err(e) => {
                    reaction.sync_status = failure_status(&e);
                    warn!(message_id, error = %e, "reaction deletion failed");
                    self.store.insert_reaction(reaction)?;
                }
            }
        }
        Ok(())
    }

    /// Mirror a reaction change onto the parent message's denormalized
    /// reaction fields, in store and live state.
    fn apply_reaction_to_message(
        &self,
        message_id: &str,
        kind: &str,
        delta: i64,
        reaction: &Reaction,
    ) -> Result<()> {
        let Some(mut message) = self.store.select_message(message_id)? else {
            return Ok(());
        };

        message
            .own_reactions
            .retain(|r| !(r.user_id == reaction.user_id && r.kind == reaction.kind));
        let count = message.reaction_counts.entry(kind.to_string()).or_insert(0);
        if delta > 0 {
            *count += delta as u64;
            message.own_reactions.push(reaction.clone());
        } else {
            *count = count.saturating_sub(delta.unsigned_abs());
        }
        if *count == 0 {
            message.reaction_counts.remove(kind);
        }

        self.store.insert_message(message.clone())?;
        if let Some(cid) = &message.cid {
            if let Some(channel) = self.registry.channel_if_active(cid) {
                channel.upsert_message(message.clone());
            }
        }
        Ok(())
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        // tears down in-flight uploads and recovery passes; every store
        // write is atomic, so on-disk state stays consistent
        self.event_task.abort();
        info!("chat session closed");
    }
}
