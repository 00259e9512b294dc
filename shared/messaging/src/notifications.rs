//! Push payloads delivered by the backend.

use crate::{ConversationType, Message, MessageRefer, PinState};
use serde::{Deserialize, Serialize};

/// Server-side pin record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagePin {
    pub message_refer: MessageRefer,
    pub operator_id: String,
    pub server_extension: Option<String>,
    pub create_time: i64,
    pub update_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinNotification {
    pub pin_state: PinState,
    pub pin: MessagePin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevokeNotification {
    pub message_refer: MessageRefer,
    /// Full message, when the backend still has it.
    pub message: Option<Message>,
    pub revoke_account_id: String,
    pub server_extension: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedNotification {
    pub message_refer: MessageRefer,
    pub delete_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearHistoryNotification {
    pub conversation_id: String,
    pub delete_time: i64,
}

/// Direct-chat read receipt: the peer has read everything up to `timestamp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct P2pReceipt {
    pub conversation_id: String,
    pub timestamp: i64,
}

/// Group read receipt for a single message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamReceipt {
    pub conversation_id: String,
    pub client_id: String,
    pub server_id: Option<String>,
    pub read_count: u32,
    pub unread_count: u32,
}

/// Which members have and have not read one group message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamReceiptDetail {
    pub conversation_id: String,
    pub client_id: String,
    pub read_account_ids: Vec<String>,
    pub unread_account_ids: Vec<String>,
}

impl TeamReceiptDetail {
    /// Aggregate counts matching this detail.
    pub fn summary(&self) -> TeamReceipt {
        TeamReceipt {
            conversation_id: self.conversation_id.clone(),
            client_id: self.client_id.clone(),
            server_id: None,
            read_count: self.read_account_ids.len() as u32,
            unread_count: self.unread_account_ids.len() as u32,
        }
    }
}

/// Conversation list entry as reported on sync or change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    pub conversation_id: String,
    pub conversation_type: ConversationType,
    pub unread_count: u32,
    /// Time up to which the current user has read the conversation.
    pub read_time: i64,
}
