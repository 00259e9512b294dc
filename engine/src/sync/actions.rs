//! User-initiated actions.
//!
//! Each action logs on entry, success and failure, surfaces backend
//! rejections to the caller, and leaves the cache either untouched or in an
//! explicit failed state. State is re-read after every await.

use super::model::{recall_id, CachedMessage, EditWindow, UploadState};
use super::{CacheEvent, EngineError, EngineResult, MessageSyncEngine};
use crate::backend::{
    AiRegenerate, AiStreamStop, HistoryQuery, ProgressSink, PushConfig, SendParams,
    VoiceToTextRequest,
};
use crate::store::PinRecord;
use crate::timer::ScheduledTask;
use futures::future::join_all;
use msgsync_messaging::{
    now_ms, parse_conversation_type, parse_target_id, AddCollectionParams, AiStatus,
    AiStreamStatus, Collection, CollectionQuery, Message, MessageRefer, MessageType, PinState,
    ReplyReference, SendingState, ServerExtension, TeamReceiptDetail,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// An outgoing message and how to present it while it is in flight.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub conversation_id: String,
    pub message: Message,
    /// Replaces whatever extension the message already carries.
    pub server_extension: Option<ServerExtension>,
    /// Local media shown until the upload has a remote url.
    pub preview: Option<String>,
    pub track_progress: bool,
}

impl SendRequest {
    pub fn new(conversation_id: impl Into<String>, message: Message) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            message,
            server_extension: None,
            preview: None,
            track_progress: false,
        }
    }

    pub fn with_extension(mut self, extension: ServerExtension) -> Self {
        self.server_extension = Some(extension);
        self
    }

    pub fn with_preview(mut self, preview: impl Into<String>) -> Self {
        self.preview = Some(preview.into());
        self
    }

    pub fn with_progress(mut self) -> Self {
        self.track_progress = true;
        self
    }
}

/// One page of history to load.
#[derive(Debug, Clone)]
pub struct HistoryRequest {
    pub conversation_id: String,
    /// Upper bound on `create_time`; `0` means "now".
    pub end_time: i64,
    /// Cached message to page back from.
    pub anchor_client_id: Option<String>,
    pub limit: usize,
}

impl HistoryRequest {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            end_time: 0,
            anchor_client_id: None,
            limit: 100,
        }
    }

    pub fn with_end_time(mut self, end_time: i64) -> Self {
        self.end_time = end_time;
        self
    }

    pub fn with_anchor(mut self, client_id: impl Into<String>) -> Self {
        self.anchor_client_id = Some(client_id.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

impl MessageSyncEngine {
    /// Send a message optimistically.
    ///
    /// The message is cached as `Sending` before the request goes out. On
    /// success it is replaced by the acknowledged record; on cancellation it
    /// is removed; on any other failure it stays cached as `Failed` with the
    /// backend's error code.
    pub async fn send_message(&self, request: SendRequest) -> EngineResult<Message> {
        self.ensure_active()?;
        let SendRequest {
            conversation_id,
            mut message,
            server_extension,
            preview,
            track_progress,
        } = request;
        let config = self.config();
        info!(%conversation_id, client_id = %message.client_id, "sending message");

        let (account_id, reply) = {
            let state = self.lock();
            (
                state.session.account_id.clone(),
                state.reply_drafts.get(&conversation_id).cloned(),
            )
        };

        let extension = match server_extension {
            Some(extension) => Some(extension),
            None => match ServerExtension::parse(message.server_extension.as_deref().unwrap_or("")) {
                Ok(extension) => Some(extension),
                Err(err) => {
                    warn!(%err, client_id = %message.client_id, "keeping malformed extension as-is");
                    None
                }
            },
        };
        if let Some(mut extension) = extension.clone() {
            if config.reply_by_extension {
                if let Some(replied) = &reply {
                    extension.reply = Some(reply_reference(replied));
                }
            }
            message.server_extension = extension.to_json();
        }

        message.sender_id = account_id;
        message.is_self = true;
        message.receiver_id = parse_target_id(&conversation_id)
            .map(str::to_string)
            .unwrap_or_default();
        if let Ok(conversation_type) = parse_conversation_type(&conversation_id) {
            message.conversation_type = conversation_type;
        }
        message.conversation_id = conversation_id.clone();
        let is_text = message.message_type == MessageType::Text;
        let threaded_reply = reply.clone().filter(|_| is_text);
        if let Some(replied) = &threaded_reply {
            message.thread_reply = Some(replied.refer());
        }
        message.sending_state = Some(SendingState::Sending);

        let mut optimistic = CachedMessage::from(message.clone());
        optimistic.upload = UploadState {
            progress: track_progress.then_some(0),
            speed: None,
            preview,
        };

        let ai = {
            let mut state = self.lock();
            let ai = state.ai_request_for(
                &message,
                reply.as_ref(),
                config.ai_context_limit,
                config.ai_stream,
            );
            let client_ids = state.upsert(&conversation_id, vec![optimistic]);
            self.notify_upserted(&conversation_id, client_ids);
            ai
        };

        let params = SendParams {
            ai,
            push: push_config(extension.as_ref(), &message, &config.mention_all_account),
            read_receipt_enabled: true,
        };
        let pending = message.clone();
        let client_id = message.client_id.clone();
        let result = match threaded_reply {
            Some(replied) if !config.reply_by_extension => {
                self.backend().reply_message(message, replied, params).await
            }
            _ => {
                let progress = track_progress.then(|| self.progress_sink(&conversation_id, &client_id));
                self.backend()
                    .send_message(message, &conversation_id, params, progress)
                    .await
            }
        };

        let outcome = match result {
            Ok(confirmed) => {
                self.settle_sent(&conversation_id, confirmed.clone());
                info!(%conversation_id, %client_id, "message sent");
                Ok(confirmed)
            }
            Err(err) if err.code == config.cancelled_error_code => {
                info!(%conversation_id, %client_id, "send cancelled");
                self.remove_messages(Some(&conversation_id), &[client_id]);
                Err(err.into())
            }
            Err(err) => {
                error!(%err, %conversation_id, %client_id, "send failed");
                self.settle_failed(&conversation_id, pending, err.code);
                Err(err.into())
            }
        };
        if is_text {
            self.clear_reply_draft(&conversation_id);
        }
        outcome
    }

    /// Cancel an in-flight attachment upload and drop the optimistic entry.
    pub async fn cancel_upload(&self, conversation_id: &str, client_id: &str) -> EngineResult<()> {
        self.ensure_active()?;
        let message = self.cached(conversation_id, client_id)?.to_backend();
        if !message.message_type.has_upload() {
            return Err(EngineError::NoUpload(client_id.to_string()));
        }
        info!(conversation_id, client_id, "cancelling upload");
        if let Err(err) = self.backend().cancel_attachment_upload(&message).await {
            error!(%err, conversation_id, client_id, "cancel upload failed");
            return Err(err.into());
        }
        self.remove_messages(Some(conversation_id), &[client_id.to_string()]);
        Ok(())
    }

    /// Recall one of the user's messages, replacing it with a tombstone.
    pub async fn recall_message(&self, conversation_id: &str, client_id: &str) -> EngineResult<()> {
        self.ensure_active()?;
        let original = self.cached(conversation_id, client_id)?.to_backend();
        info!(conversation_id, client_id, "recalling message");
        if let Err(err) = self.backend().revoke_message(&original).await {
            error!(%err, conversation_id, client_id, "recall failed");
            return Err(err.into());
        }

        let tombstone = self.self_recall_tombstone(&original);
        let client_ids = [client_id.to_string()];
        let mut state = self.lock();
        let removed = state.remove(Some(conversation_id), &client_ids);
        self.notify_removed(Some(conversation_id), &client_ids, removed);
        let upserted = state.upsert(conversation_id, vec![tombstone]);
        self.notify_upserted(conversation_id, upserted);
        info!(conversation_id, client_id, "message recalled");
        Ok(())
    }

    /// Delete messages for the current user. Pinned ones are unpinned first,
    /// best effort.
    pub async fn delete_messages(
        &self,
        conversation_id: &str,
        client_ids: &[String],
    ) -> EngineResult<()> {
        self.ensure_active()?;
        let entries: Vec<CachedMessage> = {
            let state = self.lock();
            client_ids
                .iter()
                .filter_map(|id| state.find(conversation_id, id).cloned())
                .collect()
        };
        if entries.is_empty() {
            return Ok(());
        }
        info!(conversation_id, count = entries.len(), "deleting messages");

        let unpins = entries
            .iter()
            .filter(|m| m.pin_state.is_pinned())
            .map(|m| {
                let refer = m.message.refer();
                async move {
                    let result = self.backend().unpin_message(&refer, None).await;
                    (refer.client_id, result)
                }
            });
        for (client_id, result) in join_all(unpins).await {
            if let Err(err) = result {
                warn!(%err, conversation_id, %client_id, "unpin before delete failed, continuing");
            }
        }

        let messages: Vec<Message> = entries.iter().map(CachedMessage::to_backend).collect();
        if let Err(err) = self.backend().delete_messages(&messages).await {
            error!(%err, conversation_id, "delete failed");
            return Err(err.into());
        }

        let deleted: Vec<String> = entries.iter().map(|m| m.client_id().to_string()).collect();
        let removed = {
            let mut state = self.lock();
            state.pins.delete(conversation_id, &deleted);
            state.remove(Some(conversation_id), &deleted)
        };
        self.notify_removed(Some(conversation_id), &deleted, removed);
        info!(conversation_id, "messages deleted");
        Ok(())
    }

    pub async fn pin_message(
        &self,
        conversation_id: &str,
        client_id: &str,
        server_extension: Option<String>,
    ) -> EngineResult<()> {
        self.ensure_active()?;
        let message = self.cached(conversation_id, client_id)?.to_backend();
        info!(conversation_id, client_id, "pinning message");
        self.backend()
            .pin_message(&message, server_extension)
            .await
            .map_err(|err| {
                warn!(%err, conversation_id, client_id, "pin failed");
                err.into()
            })
    }

    pub async fn unpin_message(
        &self,
        refer: &MessageRefer,
        server_extension: Option<String>,
    ) -> EngineResult<()> {
        self.ensure_active()?;
        info!(conversation_id = %refer.conversation_id, client_id = %refer.client_id, "unpinning message");
        self.backend()
            .unpin_message(refer, server_extension)
            .await
            .map_err(|err| {
                warn!(%err, client_id = %refer.client_id, "unpin failed");
                err.into()
            })
    }

    pub async fn update_pin_message(
        &self,
        conversation_id: &str,
        client_id: &str,
        server_extension: Option<String>,
    ) -> EngineResult<()> {
        self.ensure_active()?;
        let message = self.cached(conversation_id, client_id)?.to_backend();
        info!(conversation_id, client_id, "updating pin");
        self.backend()
            .update_pin_message(&message, server_extension)
            .await
            .map_err(|err| {
                warn!(%err, conversation_id, client_id, "pin update failed");
                err.into()
            })
    }

    /// Pinned messages of a conversation, newest message first.
    ///
    /// Served from the pin table when the conversation is tracked, otherwise
    /// fetched from the backend. Records whose message body cannot be
    /// completed are left out.
    pub async fn pinned_messages(&self, conversation_id: &str) -> EngineResult<Vec<PinRecord>> {
        self.ensure_active()?;
        let cached = self
            .lock()
            .pins
            .get(conversation_id)
            .map(|pins| pins.values().cloned().collect::<Vec<_>>());
        let records = match cached {
            Some(records) => records,
            None => self.fetch_pins(conversation_id).await,
        };

        let incomplete = records.iter().any(|r| r.message.is_none());
        let records = self.complete_pins(records).await;
        if incomplete {
            let mut state = self.lock();
            let still_tracked: Vec<PinRecord> = match state.pins.peek(conversation_id) {
                Some(current) => records
                    .iter()
                    .filter(|r| r.message.is_some() && current.contains_key(r.client_id()))
                    .cloned()
                    .collect(),
                None => Vec::new(),
            };
            if !still_tracked.is_empty() {
                state.pins.set(conversation_id, still_tracked);
            }
        }

        let mut pinned: Vec<PinRecord> = records
            .into_iter()
            .filter(|r| r.pin_state.is_pinned() && r.message.is_some())
            .collect();
        pinned.sort_by_key(|r| std::cmp::Reverse(r.message.as_ref().map_or(0, |m| m.create_time)));
        Ok(pinned)
    }

    /// Load a page of history into the cache. For group conversations the
    /// read counts of the user's own messages are fetched as well.
    pub async fn fetch_history(&self, request: HistoryRequest) -> EngineResult<Vec<Message>> {
        self.ensure_active()?;
        let conversation_id = request.conversation_id;
        let anchor = request
            .anchor_client_id
            .as_deref()
            .and_then(|id| self.message(&conversation_id, id))
            .map(|m| m.to_backend());
        let query = HistoryQuery {
            conversation_id: conversation_id.clone(),
            end_time: request.end_time,
            anchor,
            limit: request.limit,
        };
        info!(%conversation_id, limit = query.limit, "fetching history");

        let messages = match self.backend().get_message_list(query).await {
            Ok(messages) => messages,
            Err(err) => {
                error!(%err, %conversation_id, "history fetch failed");
                return Err(err.into());
            }
        };
        self.add_messages(
            &conversation_id,
            messages.iter().cloned().map(CachedMessage::from).collect(),
        );

        let is_group = parse_conversation_type(&conversation_id).is_ok_and(|t| t.is_group());
        if is_group && self.config().team_receipt_visible {
            let own: Vec<Message> = messages
                .iter()
                .filter(|m| m.is_self)
                .filter(|m| !matches!(m.message_type, MessageType::Notification | MessageType::Tip))
                .cloned()
                .collect();
            self.fetch_team_receipts(&conversation_id, &own).await;
        }
        info!(%conversation_id, count = messages.len(), "history fetched");
        Ok(messages)
    }

    /// Fetch and apply group read counts, best effort.
    pub async fn fetch_team_receipts(&self, conversation_id: &str, messages: &[Message]) {
        if messages.is_empty() {
            return;
        }
        let mut receipts = Vec::new();
        for batch in messages.chunks(self.config().receipt_batch_size.max(1)) {
            match self.backend().get_team_receipts(batch).await {
                Ok(found) => receipts.extend(found),
                Err(err) => warn!(%err, conversation_id, "team receipt fetch failed, continuing"),
            }
        }
        self.apply_team_receipts(receipts);
    }

    /// Tell the peer the user has read up to the newest cached message.
    pub async fn send_p2p_receipt(&self, conversation_id: &str) -> EngineResult<()> {
        self.ensure_active()?;
        let latest = self
            .lock()
            .messages
            .get(conversation_id)
            .and_then(|messages| messages.last())
            .map(CachedMessage::to_backend)
            .ok_or_else(|| EngineError::ConversationNotFound(conversation_id.to_string()))?;
        debug!(conversation_id, client_id = %latest.client_id, "sending p2p receipt");
        self.backend().send_p2p_receipt(&latest).await.map_err(|err| {
            error!(%err, conversation_id, "p2p receipt failed");
            err.into()
        })
    }

    pub async fn send_team_receipts(
        &self,
        conversation_id: &str,
        client_ids: &[String],
    ) -> EngineResult<()> {
        self.ensure_active()?;
        let messages: Vec<Message> = {
            let state = self.lock();
            client_ids
                .iter()
                .filter_map(|id| state.find(conversation_id, id))
                .map(CachedMessage::to_backend)
                .collect()
        };
        if messages.is_empty() {
            return Ok(());
        }
        debug!(conversation_id, count = messages.len(), "sending team receipts");
        self.backend().send_team_receipts(&messages).await.map_err(|err| {
            error!(%err, conversation_id, "team receipts failed");
            err.into()
        })
    }

    /// Ask the backend how far the peer has read and advance the cached
    /// receipt time if it moved forward. Returns the cached time.
    pub async fn refresh_p2p_receipt(&self, conversation_id: &str) -> EngineResult<i64> {
        self.ensure_active()?;
        let receipt = self.backend().get_p2p_receipt(conversation_id).await?;
        let mut state = self.lock();
        if let Some(timestamp) = state.apply_p2p_receipt(&receipt) {
            self.emit(CacheEvent::ReceiptTimeChanged {
                conversation_id: conversation_id.to_string(),
                timestamp,
            });
        }
        Ok(state.view_mut(conversation_id).msg_receipt_time)
    }

    /// Clear the unread counter locally and on the backend.
    pub async fn mark_conversation_read(&self, conversation_id: &str) -> EngineResult<()> {
        self.ensure_active()?;
        self.zero_unread(conversation_id);
        if let Err(err) = self.backend().clear_unread_count(conversation_id).await {
            error!(%err, conversation_id, "clear unread failed");
            return Err(err.into());
        }
        self.zero_unread(conversation_id);
        Ok(())
    }

    /// Forward a cached message to another conversation, optionally followed
    /// by a text comment. Mention and reply metadata do not travel along.
    pub async fn forward_message(
        &self,
        conversation_id: &str,
        client_id: &str,
        target_conversation_id: &str,
        comment: Option<&str>,
    ) -> EngineResult<()> {
        self.ensure_active()?;
        let source = self.cached(conversation_id, client_id)?.to_backend();
        info!(conversation_id, client_id, target_conversation_id, "forwarding message");

        let server_extension = source.server_extension.as_deref().and_then(|raw| {
            match ServerExtension::parse(raw) {
                Ok(mut extension) => {
                    extension.strip_forward_metadata();
                    extension.to_json()
                }
                Err(_) => Some(raw.to_string()),
            }
        });
        let forwarded = Message {
            client_id: Uuid::new_v4().to_string(),
            server_id: None,
            create_time: now_ms(),
            sending_state: None,
            thread_reply: None,
            ai_config: None,
            server_extension,
            ..source
        };

        if let Err(err) = self
            .send_message(SendRequest::new(target_conversation_id, forwarded))
            .await
        {
            error!(%err, client_id, target_conversation_id, "forward failed");
            return Err(err);
        }
        if let Some(comment) = comment.filter(|c| !c.is_empty()) {
            let text = Message::text(target_conversation_id, comment);
            self.send_message(SendRequest::new(target_conversation_id, text))
                .await?;
        }
        Ok(())
    }

    /// Transcribe a voice message and keep the text on the cached entry.
    pub async fn voice_to_text(&self, conversation_id: &str, client_id: &str) -> EngineResult<String> {
        self.ensure_active()?;
        let entry = self.cached(conversation_id, client_id)?;
        if let Some(text) = &entry.voice_text {
            return Ok(text.clone());
        }
        let not_voice = || EngineError::NotVoiceMessage(client_id.to_string());
        let attachment = entry
            .message
            .attachment
            .as_ref()
            .filter(|_| entry.message.message_type == MessageType::Audio)
            .ok_or_else(not_voice)?;
        let request = VoiceToTextRequest {
            voice_url: attachment.url.clone().ok_or_else(not_voice)?,
            duration_ms: attachment.duration_ms.filter(|d| *d > 0).ok_or_else(not_voice)?,
            scene_name: attachment.scene_name.clone(),
            mime_type: "aac".to_string(),
            sample_rate: "16000".to_string(),
        };
        info!(conversation_id, client_id, "transcribing voice message");

        let text = self.backend().voice_to_text(request).await.map_err(|err| {
            warn!(%err, conversation_id, client_id, "voice transcription failed");
            EngineError::from(err)
        })?;
        if text.is_empty() {
            warn!(conversation_id, client_id, "voice transcription returned no text");
            return Err(EngineError::EmptyVoiceText);
        }

        let mut state = self.lock();
        if let Some(mut current) = state.find(conversation_id, client_id).cloned() {
            current.voice_text = Some(text.clone());
            let upserted = state.upsert(conversation_id, vec![current]);
            self.notify_upserted(conversation_id, upserted);
        }
        Ok(text)
    }

    /// Stop a streamed AI reply. Unless the reply is revoked, the cached entry
    /// is marked cancelled right away; a revoke arrives as a push.
    pub async fn stop_ai_stream(
        &self,
        conversation_id: &str,
        client_id: &str,
        stop: AiStreamStop,
    ) -> EngineResult<()> {
        self.ensure_active()?;
        let reply = self.ai_reply(conversation_id, client_id)?;
        info!(conversation_id, client_id, ?stop, "stopping AI stream");
        if let Err(err) = self.backend().stop_ai_stream(&reply, stop.clone()).await {
            error!(%err, conversation_id, client_id, "stopping AI stream failed");
            return Err(err.into());
        }
        if stop == AiStreamStop::Revoke {
            return Ok(());
        }

        let mut state = self.lock();
        let Some(mut entry) = state.find(conversation_id, client_id).cloned() else {
            return Ok(());
        };
        if let Some(ai) = entry.message.ai_config.as_mut() {
            ai.stream_status = Some(AiStreamStatus::Cancelled);
        }
        if let AiStreamStop::Replace(text) = stop {
            entry.message.text = Some(text);
        }
        let upserted = state.upsert(conversation_id, vec![entry]);
        self.notify_upserted(conversation_id, upserted);
        Ok(())
    }

    /// Ask the persona for a new answer. Not allowed while the reply is
    /// still streaming; the result arrives as a push.
    pub async fn regenerate_ai_message(
        &self,
        conversation_id: &str,
        client_id: &str,
        mode: AiRegenerate,
    ) -> EngineResult<()> {
        self.ensure_active()?;
        let reply = self.ai_reply(conversation_id, client_id)?;
        if reply.ai_config.as_ref().is_some_and(|ai| ai.is_streaming()) {
            return Err(EngineError::AiStreamInProgress(client_id.to_string()));
        }
        info!(conversation_id, client_id, ?mode, "regenerating AI reply");
        self.backend()
            .regenerate_ai_message(&reply, mode)
            .await
            .map_err(|err| {
                error!(%err, conversation_id, client_id, "regenerating AI reply failed");
                err.into()
            })
    }

    /// Who has and has not read a group message. Without a member filter the
    /// cached read counts are refreshed from the result.
    pub async fn team_receipt_details(
        &self,
        conversation_id: &str,
        client_id: &str,
        member_ids: Option<&[String]>,
    ) -> EngineResult<TeamReceiptDetail> {
        self.ensure_active()?;
        let is_group = parse_conversation_type(conversation_id).is_ok_and(|t| t.is_group());
        if !is_group {
            return Err(EngineError::NotGroupConversation(conversation_id.to_string()));
        }
        let message = self.cached(conversation_id, client_id)?.to_backend();
        debug!(conversation_id, client_id, "fetching team receipt details");
        let detail = self
            .backend()
            .get_team_receipt_details(&message, member_ids)
            .await
            .map_err(|err| {
                warn!(%err, conversation_id, client_id, "team receipt details failed");
                EngineError::from(err)
            })?;
        if member_ids.is_none() {
            self.apply_team_receipts(vec![detail.summary()]);
        }
        Ok(detail)
    }

    /// Save a cached message to the user's collections.
    pub async fn add_collection(
        &self,
        conversation_id: &str,
        client_id: &str,
        collection_type: u32,
    ) -> EngineResult<Collection> {
        self.ensure_active()?;
        let message = self.cached(conversation_id, client_id)?.to_backend();
        let params = AddCollectionParams::for_message(&message, collection_type)?;
        info!(conversation_id, client_id, collection_type, "adding collection");
        match self.backend().add_collection(params).await {
            Ok(collection) => {
                self.lock().collected.insert(message.client_id.clone(), message);
                Ok(collection)
            }
            Err(err) => {
                error!(%err, conversation_id, client_id, "add collection failed");
                Err(err.into())
            }
        }
    }

    pub async fn remove_collections(&self, collections: &[Collection]) -> EngineResult<usize> {
        self.ensure_active()?;
        if collections.is_empty() {
            return Ok(0);
        }
        info!(count = collections.len(), "removing collections");
        let removed = self
            .backend()
            .remove_collections(collections)
            .await
            .map_err(|err| {
                error!(%err, count = collections.len(), "remove collections failed");
                EngineError::from(err)
            })?;
        let mut state = self.lock();
        for collection in collections {
            if let Ok(message) = collection.message() {
                state.collected.remove(&message.client_id);
            }
        }
        Ok(removed)
    }

    /// List collections and remember the messages they hold. Entries whose
    /// data is not a message are returned but not cached.
    pub async fn collections(&self, query: CollectionQuery) -> EngineResult<Vec<Collection>> {
        self.ensure_active()?;
        debug!(collection_type = ?query.collection_type, limit = query.limit, "listing collections");
        let collections = self.backend().get_collections(query).await.map_err(|err| {
            error!(%err, "collection list failed");
            EngineError::from(err)
        })?;
        let mut state = self.lock();
        for collection in &collections {
            match collection.message() {
                Ok(message) => {
                    state.collected.insert(message.client_id.clone(), message);
                }
                Err(err) => {
                    debug!(%err, collection_id = %collection.collection_id, "collection holds no message");
                }
            }
        }
        Ok(collections)
    }

    /// A message previously seen in the user's collections.
    pub fn collected_message(&self, client_id: &str) -> Option<Message> {
        self.lock().collected.get(client_id).cloned()
    }

    /// Remember the message the user is replying to in its conversation.
    pub fn set_reply_draft(&self, message: Message) {
        debug!(conversation_id = %message.conversation_id, client_id = %message.client_id, "reply draft set");
        self.lock()
            .reply_drafts
            .insert(message.conversation_id.clone(), message);
    }

    pub fn reply_draft(&self, conversation_id: &str) -> Option<Message> {
        self.lock().reply_drafts.get(conversation_id).cloned()
    }

    pub fn clear_reply_draft(&self, conversation_id: &str) {
        self.lock().reply_drafts.remove(conversation_id);
    }

    fn cached(&self, conversation_id: &str, client_id: &str) -> EngineResult<CachedMessage> {
        self.message(conversation_id, client_id)
            .ok_or_else(|| EngineError::MessageNotFound {
                conversation_id: conversation_id.to_string(),
                client_id: client_id.to_string(),
            })
    }

    fn ai_reply(&self, conversation_id: &str, client_id: &str) -> EngineResult<Message> {
        let message = self.cached(conversation_id, client_id)?.to_backend();
        match &message.ai_config {
            Some(ai) if ai.status == AiStatus::Response => Ok(message),
            _ => Err(EngineError::NotAiReply(client_id.to_string())),
        }
    }

    fn settle_sent(&self, conversation_id: &str, confirmed: Message) {
        let mut state = self.lock();
        let preview = state
            .find(conversation_id, &confirmed.client_id)
            .and_then(|m| m.upload.preview.clone());
        let mut entry = CachedMessage::from(confirmed);
        let has_remote = entry
            .message
            .attachment
            .as_ref()
            .is_some_and(|a| a.url.is_some());
        if !has_remote {
            entry.upload.preview = preview;
        }
        let upserted = state.upsert(conversation_id, vec![entry]);
        self.notify_upserted(conversation_id, upserted);
    }

    fn settle_failed(&self, conversation_id: &str, pending: Message, code: i32) {
        let mut state = self.lock();
        let mut entry = state
            .find(conversation_id, &pending.client_id)
            .cloned()
            .unwrap_or_else(|| CachedMessage::from(pending.clone()));
        entry.cancel_timers();
        entry.message = pending;
        entry.message.sending_state = Some(SendingState::Failed);
        entry.error_code = Some(code);
        entry.upload.progress = None;
        entry.upload.speed = None;
        let upserted = state.upsert(conversation_id, vec![entry]);
        self.notify_upserted(conversation_id, upserted);
    }

    fn progress_sink(&self, conversation_id: &str, client_id: &str) -> ProgressSink {
        let engine = Arc::downgrade(&self.inner);
        let conversation_id = conversation_id.to_string();
        let client_id = client_id.to_string();
        Arc::new(move |percentage| {
            if let Some(inner) = engine.upgrade() {
                MessageSyncEngine { inner }.record_upload_progress(
                    &conversation_id,
                    &client_id,
                    percentage,
                );
            }
        })
    }

    fn record_upload_progress(&self, conversation_id: &str, client_id: &str, percentage: u8) {
        let mut state = self.lock();
        let Some(mut entry) = state.find(conversation_id, client_id).cloned() else {
            return;
        };
        entry.upload.progress = Some(percentage.min(100));
        let upserted = state.upsert(conversation_id, vec![entry]);
        self.notify_upserted(conversation_id, upserted);
    }

    /// Tombstone for the user's own recall. Re-editable types stay editable
    /// for the configured window.
    pub(super) fn self_recall_tombstone(&self, original: &Message) -> CachedMessage {
        let mut tombstone = CachedMessage::self_recall_tombstone(original);
        if original.message_type.is_re_editable() {
            let timer = self.schedule_edit_expiry(
                original.conversation_id.clone(),
                recall_id(&original.client_id),
            );
            tombstone.edit_window = Some(EditWindow {
                can_edit: true,
                timer: Some(timer),
            });
        }
        tombstone
    }

    fn schedule_edit_expiry(&self, conversation_id: String, client_id: String) -> ScheduledTask {
        let engine = Arc::downgrade(&self.inner);
        ScheduledTask::spawn(self.config().recall_edit_window, move || {
            if let Some(inner) = engine.upgrade() {
                MessageSyncEngine { inner }.expire_edit_window(&conversation_id, &client_id);
            }
        })
    }

    fn expire_edit_window(&self, conversation_id: &str, client_id: &str) {
        let mut state = self.lock();
        let Some(mut entry) = state.find(conversation_id, client_id).cloned() else {
            return;
        };
        let Some(window) = entry.edit_window.as_mut() else {
            return;
        };
        window.can_edit = false;
        debug!(conversation_id, client_id, "recall edit window closed");
        let upserted = state.upsert(conversation_id, vec![entry]);
        self.notify_upserted(conversation_id, upserted);
    }

    fn zero_unread(&self, conversation_id: &str) {
        let mut state = self.lock();
        let view = state.view_mut(conversation_id);
        let unread_changed = view.unread_count != 0;
        view.unread_count = 0;
        let mentions_cleared = !view.mention_ids.is_empty();
        view.mention_ids.clear();

        if unread_changed {
            self.emit(CacheEvent::ConversationChanged {
                conversation_id: conversation_id.to_string(),
            });
        }
        if mentions_cleared {
            self.emit(CacheEvent::MentionsChanged {
                conversation_id: conversation_id.to_string(),
                mention_ids: Vec::new(),
            });
        }
    }

    async fn fetch_pins(&self, conversation_id: &str) -> Vec<PinRecord> {
        debug!(conversation_id, "fetching pinned messages");
        let pins = match self.backend().get_pinned_messages(conversation_id).await {
            Ok(pins) => pins,
            Err(err) => {
                warn!(%err, conversation_id, "pin list fetch failed, continuing");
                Vec::new()
            }
        };
        let records: Vec<PinRecord> = pins
            .into_iter()
            .map(|pin| PinRecord::from_pin(pin, PinState::Pinned))
            .collect();

        let mut state = self.lock();
        if let Some(evicted) = state.pins.set(conversation_id, records.clone()) {
            debug!(conversation_id = %evicted, "pin table evicted conversation");
        }
        let changed = state.reflect_pin_states(conversation_id, &records);
        self.notify_upserted(conversation_id, changed);
        self.emit(CacheEvent::PinsChanged {
            conversation_id: conversation_id.to_string(),
        });
        records
    }

    /// Fill in missing message bodies by reference, best effort.
    pub(super) async fn complete_pins(&self, records: Vec<PinRecord>) -> Vec<PinRecord> {
        let refers: Vec<MessageRefer> = records
            .iter()
            .filter(|r| r.message.is_none())
            .map(|r| r.message_refer.clone())
            .collect();
        if refers.is_empty() {
            return records;
        }
        let found = match self.backend().get_messages_by_refers(&refers).await {
            Ok(found) => found,
            Err(err) => {
                warn!(%err, count = refers.len(), "pinned message completion failed, continuing");
                return records;
            }
        };
        records
            .into_iter()
            .map(|mut record| {
                if record.message.is_none() {
                    record.message = found
                        .iter()
                        .find(|m| m.client_id == record.client_id())
                        .cloned();
                }
                record
            })
            .collect()
    }
}

fn reply_reference(replied: &Message) -> ReplyReference {
    ReplyReference {
        client_id: replied.client_id.clone(),
        server_id: replied.server_id.clone(),
        conversation_type: replied.conversation_type.code(),
        sender_id: replied.sender_id.clone(),
        receiver_id: replied.receiver_id.clone(),
        conversation_id: replied.conversation_id.clone(),
        time: replied.create_time,
    }
}

/// Mentions force a push to the mentioned accounts, or to everyone.
fn push_config(
    extension: Option<&ServerExtension>,
    message: &Message,
    everyone: &str,
) -> Option<PushConfig> {
    let extension = extension?;
    extension.mentions.as_ref()?;
    Some(PushConfig {
        force_push: true,
        force_push_account_ids: extension.force_push_accounts(everyone),
        force_push_content: message.text.clone().unwrap_or_default(),
    })
}
