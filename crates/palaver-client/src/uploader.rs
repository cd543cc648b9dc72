//! Attachment upload pipeline.
//!
//! Each attachment walks `Idle -> InProgress -> {Success | Failed}`; the
//! worker enforces at-most-one in-flight run per (cid, message id), skips
//! attachments that already succeeded, and gates the owning message's sync
//! status on the outcome: all uploads succeeded moves
//! `AwaitingAttachments -> SyncNeeded`, any failure moves it to
//! `FailedPermanently` so the message is never handed to the transport.

use std::collections::HashSet;
use std::path::Path;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use palaver_core::{Attachment, AttachmentKind, Cid, Message, SyncStatus, UploadState};
use palaver_store::ChatStore;
use palaver_transport::{TransportHandle, UploadRequest, UploadedFile};

use crate::error::{ChatError, Result};

/// Background worker uploading a message's pending attachments.
pub struct AttachmentUploader {
    store: ChatStore,
    transport: TransportHandle,
    in_flight: Mutex<HashSet<(Cid, String)>>,
}

impl AttachmentUploader {
    pub fn new(store: ChatStore, transport: TransportHandle) -> Self {
        Self {
            store,
            transport,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Upload every pending attachment of a message, persisting each state
    /// change.  Returns `Ok(None)` when an upload run for the same
    /// (cid, message) key is already in flight.
    pub async fn upload_for_message(&self, cid: &Cid, message_id: &str) -> Result<Option<Message>> {
        let key = (cid.clone(), message_id.to_string());
        {
            let mut in_flight = self.in_flight.lock();
            if !in_flight.insert(key.clone()) {
                debug!(cid = %cid, message_id, "upload already in flight, skipping");
                return Ok(None);
            }
        }

        let result = self.run(cid, message_id).await;
        self.in_flight.lock().remove(&key);
        result.map(Some)
    }

    async fn run(&self, cid: &Cid, message_id: &str) -> Result<Message> {
        let Some(mut message) = self.store.select_message(message_id)? else {
            return Err(ChatError::InvalidInput(format!(
                "unknown message `{message_id}`"
            )));
        };

        for index in 0..message.attachments.len() {
            let state = message.attachments[index].upload_state.clone();
            match state {
                // idempotent retry: done is done
                UploadState::Success { .. } => continue,
                // terminal; re-upload needs an explicit user action
                UploadState::Failed { .. } => continue,
                UploadState::Idle | UploadState::InProgress { .. } => {
                    self.upload_one(cid, &mut message, index).await?;
                }
            }
        }

        let any_failed = message
            .attachments
            .iter()
            .any(|a| a.upload_state.is_failed());
        let all_success = message
            .attachments
            .iter()
            .all(|a| a.upload_state.is_success());

        if any_failed {
            message.sync_status = SyncStatus::FailedPermanently;
        } else if all_success && message.sync_status == SyncStatus::AwaitingAttachments {
            message.sync_status = SyncStatus::SyncNeeded;
        }

        self.store.insert_message(message.clone())?;
        Ok(message)
    }

    /// Upload a single attachment, streaming progress into its state.
    async fn upload_one(&self, cid: &Cid, message: &mut Message, index: usize) -> Result<()> {
        let attachment = message.attachments[index].clone();
        let file_name = attachment_file_name(&attachment);

        let bytes = match &attachment.local_path {
            Some(path) => match tokio::fs::read(path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(cid = %cid, file = %file_name, error = %e, "cannot read attachment");
                    return self.record_state(
                        message,
                        index,
                        UploadState::Failed {
                            error: format!("cannot read local file: {e}"),
                        },
                    );
                }
            },
            None => {
                return self.record_state(
                    message,
                    index,
                    UploadState::Failed {
                        error: "attachment has no local file".into(),
                    },
                );
            }
        };

        let total_bytes = bytes.len() as u64;

        // First progress delivery; fires even for zero-byte files.
        self.record_state(
            message,
            index,
            UploadState::InProgress {
                bytes_uploaded: 0,
                total_bytes,
            },
        )?;

        let mime_type = sniff_mime(&bytes, attachment.local_path.as_deref());
        let kind = classify(mime_type.as_deref());

        let (progress_tx, mut progress_rx) = mpsc::channel(16);
        let request = UploadRequest {
            cid: cid.clone(),
            message_id: message.id.clone(),
            file_name: file_name.clone(),
            mime_type: mime_type.clone(),
            bytes: Bytes::from(bytes),
            progress: Some(progress_tx),
        };

        let call = async {
            match kind {
                AttachmentKind::Image => self.transport.upload_image(request).await,
                _ => self.transport.upload_file(request).await,
            }
        };
        tokio::pin!(call);

        // Drain progress while the call runs, dropping out-of-order ticks so
        // delivered updates are strictly increasing per attachment.
        let mut last_delivered = 0u64;
        let mut progress_open = true;
        let outcome = loop {
            tokio::select! {
                tick = progress_rx.recv(), if progress_open => match tick {
                    Some(p) if p.bytes_uploaded > last_delivered => {
                        last_delivered = p.bytes_uploaded;
                        self.record_state(
                            message,
                            index,
                            UploadState::InProgress {
                                bytes_uploaded: p.bytes_uploaded,
                                total_bytes,
                            },
                        )?;
                    }
                    Some(_) => {}
                    None => progress_open = false,
                },
                result = &mut call => break result,
            }
        };

        match outcome {
            Ok(uploaded) => {
                self.enrich(message, index, &uploaded, mime_type, total_bytes, kind, file_name);
                self.record_state(
                    message,
                    index,
                    UploadState::Success { url: uploaded.url },
                )
            }
            Err(e) => {
                warn!(cid = %cid, file = %file_name, error = %e, "attachment upload failed");
                self.record_state(
                    message,
                    index,
                    UploadState::Failed {
                        error: e.to_string(),
                    },
                )
            }
        }
    }

    /// Fill in the remote fields after a successful upload.
    #[allow(clippy::too_many_arguments)]
    fn enrich(
        &self,
        message: &mut Message,
        index: usize,
        uploaded: &UploadedFile,
        mime_type: Option<String>,
        total_bytes: u64,
        kind: AttachmentKind,
        file_name: String,
    ) {
        let attachment = &mut message.attachments[index];
        attachment.url = Some(uploaded.url.clone());
        attachment.thumb_url = uploaded.thumb_url.clone();
        attachment.mime_type = mime_type;
        attachment.file_size = Some(total_bytes);
        attachment.kind = Some(kind);
        if attachment.title.is_none() {
            attachment.title = Some(file_name);
        }
    }

    /// Persist an attachment state change on the owning message.
    fn record_state(&self, message: &mut Message, index: usize, state: UploadState) -> Result<()> {
        message.attachments[index].upload_state = state;
        self.store.insert_message(message.clone())?;
        Ok(())
    }
}

fn attachment_file_name(attachment: &Attachment) -> String {
    attachment
        .title
        .clone()
        .or_else(|| {
            attachment
                .local_path
                .as_deref()
                .and_then(Path::file_name)
                .map(|n| n.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| "file".to_string())
}

/// MIME sniffing with a path-based fallback.
fn sniff_mime(bytes: &[u8], path: Option<&Path>) -> Option<String> {
    infer::get(bytes)
        .map(|t| t.mime_type().to_string())
        .or_else(|| path.and_then(|p| mime_guess::from_path(p).first().map(|m| m.to_string())))
}

/// Bucket a MIME type into {image, video, file}.
fn classify(mime_type: Option<&str>) -> AttachmentKind {
    match mime_type {
        Some(m) if m.starts_with("image/") => AttachmentKind::Image,
        Some(m) if m.starts_with("video/") => AttachmentKind::Video,
        _ => AttachmentKind::File,
    }
}
