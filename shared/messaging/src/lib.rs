//! Message records exchanged with the IM backend client.
//!
//! These types mirror what the backend hands out (pushes, acknowledgements,
//! history pages). The engine wraps them in its own cache records and never
//! mutates them in place.

pub mod collection;
pub mod conversation;
pub mod extension;
pub mod notifications;

pub use collection::{AddCollectionParams, Collection, CollectionQuery};
pub use conversation::{conversation_id, parse_conversation_type, parse_target_id};
pub use extension::{Mention, MentionSegment, ReplyReference, ServerExtension};
pub use notifications::{
    ClearHistoryNotification, ConversationSnapshot, DeletedNotification, MessagePin,
    P2pReceipt, PinNotification, RevokeNotification, TeamReceipt, TeamReceiptDetail,
};

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Kind of conversation a message belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationType {
    #[default]
    P2p,
    Team,
    SuperTeam,
}

impl ConversationType {
    pub fn code(self) -> u8 {
        match self {
            Self::P2p => 1,
            Self::Team => 2,
            Self::SuperTeam => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::P2p),
            2 => Some(Self::Team),
            3 => Some(Self::SuperTeam),
            _ => None,
        }
    }

    /// Group and broad-group conversations share receipt and mention rules.
    pub fn is_group(self) -> bool {
        matches!(self, Self::Team | Self::SuperTeam)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    Audio,
    Video,
    File,
    Custom,
    Notification,
    Tip,
}

impl MessageType {
    /// Types carrying an uploaded attachment.
    pub fn has_upload(self) -> bool {
        matches!(self, Self::Image | Self::Video | Self::File | Self::Audio)
    }

    /// Types whose content can be re-edited after a recall.
    pub fn is_re_editable(self) -> bool {
        matches!(self, Self::Text | Self::Custom)
    }
}

/// Local delivery state of a message the current user authored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendingState {
    Sending,
    Succeeded,
    Failed,
}

/// Pin state as reported by the backend: 0 not pinned, 1 pinned, 2 pin updated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinState {
    #[default]
    NotPinned,
    Pinned,
    Updated,
}

impl PinState {
    pub fn code(self) -> u8 {
        match self {
            Self::NotPinned => 0,
            Self::Pinned => 1,
            Self::Updated => 2,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Self::Pinned,
            2 => Self::Updated,
            _ => Self::NotPinned,
        }
    }

    pub fn is_pinned(self) -> bool {
        self != Self::NotPinned
    }
}

/// Role of an AI persona relative to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiStatus {
    /// A user message addressed to the persona.
    At,
    /// A reply produced by the persona and relayed on a user's behalf.
    Response,
}

/// Progress of a streamed AI reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiStreamStatus {
    Streaming,
    Completed,
    /// Stopped by a user before the persona finished.
    Cancelled,
    Failed,
}

/// AI relay metadata attached by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiConfig {
    pub account_id: String,
    pub status: AiStatus,
    /// Set only on streamed replies.
    #[serde(default)]
    pub stream_status: Option<AiStreamStatus>,
}

impl AiConfig {
    /// Metadata of a reply produced by `account_id`.
    pub fn response(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            status: AiStatus::Response,
            stream_status: None,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.stream_status == Some(AiStreamStatus::Streaming)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: Option<String>,
    pub name: Option<String>,
    pub size: u64,
    /// Playback length for audio and video, in milliseconds.
    pub duration_ms: Option<u64>,
    pub scene_name: Option<String>,
}

/// Stable pointer to a message, used by pins, deletes, and recalls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRefer {
    pub conversation_id: String,
    pub conversation_type: ConversationType,
    pub client_id: String,
    pub server_id: Option<String>,
    pub sender_id: String,
    pub receiver_id: String,
    pub create_time: i64,
}

/// A chat message as produced or accepted by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub client_id: String,
    pub server_id: Option<String>,
    pub conversation_id: String,
    pub conversation_type: ConversationType,
    pub sender_id: String,
    pub receiver_id: String,
    pub is_self: bool,
    pub create_time: i64,
    pub message_type: MessageType,
    pub text: Option<String>,
    pub attachment: Option<Attachment>,
    /// Raw JSON carrying mention and reply metadata.
    pub server_extension: Option<String>,
    pub ai_config: Option<AiConfig>,
    pub thread_reply: Option<MessageRefer>,
    pub sending_state: Option<SendingState>,
}

impl Message {
    /// Create a fresh local message with a new client id, stamped now.
    pub fn new(conversation_id: impl Into<String>, message_type: MessageType) -> Self {
        let conversation_id = conversation_id.into();
        let conversation_type = parse_conversation_type(&conversation_id).unwrap_or_default();
        Self {
            client_id: Uuid::new_v4().to_string(),
            conversation_id,
            conversation_type,
            create_time: now_ms(),
            message_type,
            ..Default::default()
        }
    }

    pub fn text(conversation_id: impl Into<String>, text: impl Into<String>) -> Self {
        let mut message = Self::new(conversation_id, MessageType::Text);
        message.text = Some(text.into());
        message
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_sender(mut self, sender_id: impl Into<String>, is_self: bool) -> Self {
        self.sender_id = sender_id.into();
        self.is_self = is_self;
        self
    }

    pub fn with_create_time(mut self, create_time: i64) -> Self {
        self.create_time = create_time;
        self
    }

    pub fn with_extension(mut self, extension: &ServerExtension) -> Self {
        self.server_extension = extension.to_json();
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    pub fn refer(&self) -> MessageRefer {
        MessageRefer {
            conversation_id: self.conversation_id.clone(),
            conversation_type: self.conversation_type,
            client_id: self.client_id.clone(),
            server_id: self.server_id.clone(),
            sender_id: self.sender_id.clone(),
            receiver_id: self.receiver_id.clone(),
            create_time: self.create_time,
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Messaging-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("malformed server extension: {0}")]
    InvalidExtension(#[from] serde_json::Error),
    #[error("malformed collection data: {0}")]
    InvalidCollection(serde_json::Error),
    #[error("malformed conversation id: {0}")]
    InvalidConversationId(String),
}

pub type Result<T> = std::result::Result<T, MessagingError>;
