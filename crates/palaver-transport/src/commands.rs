//! Commands sent *into* the transport task, and the typed handle wrapping
//! them.
//!
//! Every request/response call is a [`TransportCommand`] variant carrying a
//! `oneshot` reply slot.  Dropping the receiving end cancels the call from
//! the engine's point of view; the whole result type is awaitable and
//! reports either the value or a classified [`TransportError`].

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use palaver_core::{
    Channel, Cid, FilterObject, Message, QueryChannelsPaginationRequest, QuerySort, Reaction,
};

use crate::error::TransportError;

/// Reply slot carried by each command.
pub type Reply<T> = oneshot::Sender<Result<T, TransportError>>;

/// A channel-list query as sent to the server.
#[derive(Debug, Clone)]
pub struct QueryChannelsRequest {
    pub filter: FilterObject,
    pub sort: QuerySort,
    pub pagination: QueryChannelsPaginationRequest,
}

/// Upload progress tick, forwarded to the caller-supplied progress channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub bytes_uploaded: u64,
    pub total_bytes: u64,
}

/// A file upload request.
pub struct UploadRequest {
    pub cid: Cid,
    pub message_id: String,
    pub file_name: String,
    pub mime_type: Option<String>,
    pub bytes: Bytes,
    /// Progress ticks are sent here while the upload runs.  The transport
    /// drops the sender before replying, so callers can drain to completion.
    pub progress: Option<mpsc::Sender<UploadProgress>>,
}

impl std::fmt::Debug for UploadRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadRequest")
            .field("cid", &self.cid)
            .field("message_id", &self.message_id)
            .field("file_name", &self.file_name)
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub url: String,
    pub thumb_url: Option<String>,
}

/// Commands sent *into* the transport task.
#[derive(Debug)]
pub enum TransportCommand {
    SendMessage {
        message: Message,
        reply: Reply<Message>,
    },
    UpdateMessage {
        message: Message,
        reply: Reply<Message>,
    },
    DeleteMessage {
        message_id: String,
        reply: Reply<Message>,
    },
    SendReaction {
        reaction: Reaction,
        reply: Reply<Reaction>,
    },
    DeleteReaction {
        message_id: String,
        user_id: String,
        kind: String,
        reply: Reply<()>,
    },
    CreateChannel {
        channel: Channel,
        reply: Reply<Channel>,
    },
    QueryChannels {
        request: QueryChannelsRequest,
        reply: Reply<Vec<Channel>>,
    },
    /// Start watching a channel, creating it remotely if needed.  Returns
    /// the current server snapshot.
    WatchChannel {
        cid: Cid,
        reply: Reply<Channel>,
    },
    UploadFile {
        request: UploadRequest,
        reply: Reply<UploadedFile>,
    },
    UploadImage {
        request: UploadRequest,
        reply: Reply<UploadedFile>,
    },
}

/// Cloneable, typed handle over the command channel.
#[derive(Clone)]
pub struct TransportHandle {
    cmd_tx: mpsc::Sender<TransportCommand>,
}

impl TransportHandle {
    pub fn new(cmd_tx: mpsc::Sender<TransportCommand>) -> Self {
        Self { cmd_tx }
    }

    /// Build a handle plus the receiving end a transport implementation (or
    /// a test double) drains.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<TransportCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(buffer);
        (Self::new(cmd_tx), cmd_rx)
    }

    pub async fn send_message(&self, message: Message) -> Result<Message, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(TransportCommand::SendMessage { message, reply }, rx)
            .await
    }

    pub async fn update_message(&self, message: Message) -> Result<Message, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(TransportCommand::UpdateMessage { message, reply }, rx)
            .await
    }

    pub async fn delete_message(&self, message_id: String) -> Result<Message, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(TransportCommand::DeleteMessage { message_id, reply }, rx)
            .await
    }

    pub async fn send_reaction(&self, reaction: Reaction) -> Result<Reaction, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(TransportCommand::SendReaction { reaction, reply }, rx)
            .await
    }

    pub async fn delete_reaction(
        &self,
        message_id: String,
        user_id: String,
        kind: String,
    ) -> Result<(), TransportError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(
            TransportCommand::DeleteReaction {
                message_id,
                user_id,
                kind,
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn create_channel(&self, channel: Channel) -> Result<Channel, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(TransportCommand::CreateChannel { channel, reply }, rx)
            .await
    }

    pub async fn query_channels(
        &self,
        request: QueryChannelsRequest,
    ) -> Result<Vec<Channel>, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(TransportCommand::QueryChannels { request, reply }, rx)
            .await
    }

    pub async fn watch_channel(&self, cid: Cid) -> Result<Channel, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(TransportCommand::WatchChannel { cid, reply }, rx)
            .await
    }

    pub async fn upload_file(
        &self,
        request: UploadRequest,
    ) -> Result<UploadedFile, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(TransportCommand::UploadFile { request, reply }, rx)
            .await
    }

    pub async fn upload_image(
        &self,
        request: UploadRequest,
    ) -> Result<UploadedFile, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(TransportCommand::UploadImage { request, reply }, rx)
            .await
    }

    async fn dispatch<T>(
        &self,
        command: TransportCommand,
        rx: oneshot::Receiver<Result<T, TransportError>>,
    ) -> Result<T, TransportError> {
        tracing::trace!(command = ?command, "dispatching transport command");
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| TransportError::connection_closed())?;
        rx.await.map_err(|_| TransportError::connection_closed())?
    }
}
