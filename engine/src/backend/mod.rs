//! Boundary to the IM backend client.
//!
//! The engine never talks to the network itself. Requests go through
//! [`ImBackend`]; pushes arrive as [`BackendEvent`]s on a channel handed to
//! [`crate::MessageSyncEngine::listen`].

mod loopback;

pub use loopback::LoopbackBackend;

use async_trait::async_trait;
use msgsync_messaging::{
    AddCollectionParams, ClearHistoryNotification, Collection, CollectionQuery,
    ConversationSnapshot, DeletedNotification, Message, MessagePin, MessageRefer, P2pReceipt,
    PinNotification, RevokeNotification, TeamReceipt, TeamReceiptDetail,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub type BackendResult<T> = Result<T, BackendError>;

/// Rejection reported by the backend, carrying its numeric error code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("backend request failed with code {code}: {message}")]
pub struct BackendError {
    pub code: i32,
    pub message: String,
}

impl BackendError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Upload progress callback, invoked with a percentage in `0..=100`.
pub type ProgressSink = Arc<dyn Fn(u8) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiContextMessage {
    pub role: AiRole,
    pub text: String,
}

/// AI relay parameters attached to an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiRequest {
    pub account_id: String,
    /// Prompt text, absent for non-text messages sent to an AI peer.
    pub content: Option<String>,
    pub messages: Option<Vec<AiContextMessage>>,
    pub stream: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushConfig {
    pub force_push: bool,
    /// `None` pushes to every member.
    pub force_push_account_ids: Option<Vec<String>>,
    pub force_push_content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendParams {
    pub ai: Option<AiRequest>,
    pub push: Option<PushConfig>,
    pub read_receipt_enabled: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryQuery {
    pub conversation_id: String,
    /// Upper bound on `create_time`; `0` means "now".
    pub end_time: i64,
    pub anchor: Option<Message>,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceToTextRequest {
    pub voice_url: String,
    pub duration_ms: u64,
    pub scene_name: Option<String>,
    pub mime_type: String,
    pub sample_rate: String,
}

/// How to end a streamed AI reply early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiStreamStop {
    /// Keep what has streamed so far.
    Keep,
    /// Recall the partial reply.
    Revoke,
    /// Replace the partial reply with the given text.
    Replace(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiRegenerate {
    /// Overwrite the existing reply in place.
    Update,
    /// Deliver the new reply as a separate message.
    New,
}

/// Push notifications delivered by the backend client.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    MessagesReceived(Vec<Message>),
    MessagesModified(Vec<Message>),
    MessagesDeleted(Vec<DeletedNotification>),
    MessagesRevoked(Vec<RevokeNotification>),
    PinChanged(PinNotification),
    P2pReceipts(Vec<P2pReceipt>),
    TeamReceipts(Vec<TeamReceipt>),
    HistoryCleared(Vec<ClearHistoryNotification>),
    ConversationsChanged(Vec<ConversationSnapshot>),
}

/// Request surface of the IM backend client.
#[async_trait]
pub trait ImBackend: Send + Sync {
    async fn send_message(
        &self,
        message: Message,
        conversation_id: &str,
        params: SendParams,
        progress: Option<ProgressSink>,
    ) -> BackendResult<Message>;

    async fn reply_message(
        &self,
        message: Message,
        replied: Message,
        params: SendParams,
    ) -> BackendResult<Message>;

    async fn cancel_attachment_upload(&self, message: &Message) -> BackendResult<()>;

    async fn revoke_message(&self, message: &Message) -> BackendResult<()>;

    async fn delete_messages(&self, messages: &[Message]) -> BackendResult<()>;

    async fn pin_message(
        &self,
        message: &Message,
        server_extension: Option<String>,
    ) -> BackendResult<()>;

    async fn unpin_message(
        &self,
        refer: &MessageRefer,
        server_extension: Option<String>,
    ) -> BackendResult<()>;

    async fn update_pin_message(
        &self,
        message: &Message,
        server_extension: Option<String>,
    ) -> BackendResult<()>;

    async fn get_pinned_messages(&self, conversation_id: &str) -> BackendResult<Vec<MessagePin>>;

    async fn get_messages_by_refers(&self, refers: &[MessageRefer]) -> BackendResult<Vec<Message>>;

    async fn get_message_list(&self, query: HistoryQuery) -> BackendResult<Vec<Message>>;

    async fn get_team_receipts(&self, messages: &[Message]) -> BackendResult<Vec<TeamReceipt>>;

    async fn get_p2p_receipt(&self, conversation_id: &str) -> BackendResult<P2pReceipt>;

    async fn send_p2p_receipt(&self, message: &Message) -> BackendResult<()>;

    async fn send_team_receipts(&self, messages: &[Message]) -> BackendResult<()>;

    async fn clear_unread_count(&self, conversation_id: &str) -> BackendResult<()>;

    async fn voice_to_text(&self, request: VoiceToTextRequest) -> BackendResult<String>;

    async fn stop_ai_stream(&self, message: &Message, stop: AiStreamStop) -> BackendResult<()>;

    /// The regenerated reply arrives later as a push.
    async fn regenerate_ai_message(
        &self,
        message: &Message,
        mode: AiRegenerate,
    ) -> BackendResult<()>;

    /// Read and unread members of one group message, optionally restricted
    /// to `member_ids`.
    async fn get_team_receipt_details(
        &self,
        message: &Message,
        member_ids: Option<&[String]>,
    ) -> BackendResult<TeamReceiptDetail>;

    async fn add_collection(&self, params: AddCollectionParams) -> BackendResult<Collection>;

    /// Returns how many collections were removed.
    async fn remove_collections(&self, collections: &[Collection]) -> BackendResult<usize>;

    async fn get_collections(&self, query: CollectionQuery) -> BackendResult<Vec<Collection>>;
}
