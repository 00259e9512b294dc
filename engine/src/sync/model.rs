use crate::timer::ScheduledTask;
use msgsync_messaging::{
    parse_conversation_type, ConversationType, Message, MessageRefer, MessageType, PinState,
    SendingState,
};
use serde::Serialize;

/// Prefix of tombstone ids standing in for recalled messages.
pub const RECALL_ID_PREFIX: &str = "recall-";

pub fn recall_id(client_id: &str) -> String {
    format!("{RECALL_ID_PREFIX}{client_id}")
}

/// Who a message is shown as coming from.
///
/// For AI replies relayed on a user's behalf this is the AI persona, while the
/// wrapped [`Message`] keeps the literal protocol sender.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sender {
    pub account_id: String,
    pub is_self: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecallKind {
    /// Recalled by the current user.
    SelfRecalled,
    /// Recalled by someone else. Never user-deletable.
    PeerRecalled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecallMarker {
    pub kind: RecallKind,
    /// Text of the recalled message, kept for re-editing.
    pub original_text: Option<String>,
}

/// Re-edit capability of a self-recalled message.
#[derive(Debug, Clone, PartialEq)]
pub struct EditWindow {
    pub can_edit: bool,
    /// Flips `can_edit` off when it fires. `None` once no expiry is pending.
    pub timer: Option<ScheduledTask>,
}

/// Group read counts for one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Receipt {
    pub unread_count: u32,
    pub read_count: u32,
}

/// Client-only upload presentation state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadState {
    pub progress: Option<u8>,
    pub speed: Option<u64>,
    /// Local preview shown until the attachment has a remote url.
    pub preview: Option<String>,
}

/// A message as held by the cache: the backend record plus client-side state.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedMessage {
    pub message: Message,
    pub display_sender: Sender,
    pub error_code: Option<i32>,
    pub pin_state: PinState,
    pub pin_operator_id: Option<String>,
    pub recall: Option<RecallMarker>,
    pub edit_window: Option<EditWindow>,
    pub receipt: Option<Receipt>,
    pub upload: UploadState,
    pub voice_text: Option<String>,
}

impl From<Message> for CachedMessage {
    fn from(message: Message) -> Self {
        let display_sender = Sender {
            account_id: message.sender_id.clone(),
            is_self: message.is_self,
        };
        Self {
            message,
            display_sender,
            error_code: None,
            pin_state: PinState::NotPinned,
            pin_operator_id: None,
            recall: None,
            edit_window: None,
            receipt: None,
            upload: UploadState::default(),
            voice_text: None,
        }
    }
}

impl CachedMessage {
    pub fn client_id(&self) -> &str {
        &self.message.client_id
    }

    pub fn conversation_id(&self) -> &str {
        &self.message.conversation_id
    }

    pub fn create_time(&self) -> i64 {
        self.message.create_time
    }

    pub fn sending_state(&self) -> Option<SendingState> {
        self.message.sending_state
    }

    pub fn is_sending(&self) -> bool {
        self.message.sending_state == Some(SendingState::Sending)
    }

    pub fn can_edit(&self) -> bool {
        self.edit_window.as_ref().is_some_and(|w| w.can_edit)
    }

    pub fn is_peer_recall(&self) -> bool {
        self.recall
            .as_ref()
            .is_some_and(|r| r.kind == RecallKind::PeerRecalled)
    }

    /// The record to hand back to the backend: literal protocol sender, no
    /// client-only fields.
    pub fn to_backend(&self) -> Message {
        self.message.clone()
    }

    /// Stop any pending timers owned by this entry.
    pub fn cancel_timers(&self) {
        if let Some(timer) = self.edit_window.as_ref().and_then(|w| w.timer.as_ref()) {
            timer.cancel();
        }
    }

    pub(crate) fn edit_timer(&self) -> Option<&ScheduledTask> {
        self.edit_window.as_ref().and_then(|w| w.timer.as_ref())
    }

    /// Tombstone for a message recalled by the current user. The caller adds
    /// the edit window when the original type allows it.
    pub fn self_recall_tombstone(original: &Message) -> Self {
        let mut message = original.clone();
        message.client_id = recall_id(&original.client_id);
        message.message_type = MessageType::Custom;
        message.sending_state = Some(SendingState::Succeeded);
        message.is_self = true;

        let mut tombstone = Self::from(message);
        tombstone.recall = Some(RecallMarker {
            kind: RecallKind::SelfRecalled,
            original_text: original.text.clone(),
        });
        tombstone
    }

    /// Tombstone for a message recalled by someone else.
    pub fn peer_recall_tombstone(refer: &MessageRefer, my_account_id: &str) -> Self {
        let message = Message {
            client_id: recall_id(&refer.client_id),
            server_id: refer.server_id.clone(),
            conversation_id: refer.conversation_id.clone(),
            conversation_type: refer.conversation_type,
            sender_id: refer.sender_id.clone(),
            receiver_id: refer.receiver_id.clone(),
            is_self: refer.sender_id == my_account_id,
            create_time: refer.create_time,
            message_type: MessageType::Custom,
            sending_state: Some(SendingState::Succeeded),
            ..Default::default()
        };

        let mut tombstone = Self::from(message);
        tombstone.recall = Some(RecallMarker {
            kind: RecallKind::PeerRecalled,
            original_text: None,
        });
        tombstone
    }
}

/// Per-conversation state the engine augments: unread bookkeeping, receipt
/// time and mention markers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConversationView {
    pub conversation_id: String,
    pub conversation_type: ConversationType,
    pub unread_count: u32,
    /// The current user has read everything up to here.
    pub read_time: i64,
    /// The peer has read everything up to here (direct chats).
    pub msg_receipt_time: i64,
    /// Unacknowledged messages mentioning the current user, oldest first.
    pub mention_ids: Vec<String>,
}

impl ConversationView {
    pub fn new(conversation_id: &str) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            conversation_type: parse_conversation_type(conversation_id).unwrap_or_default(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_recall_tombstone_reclassifies() {
        let original = Message::text("me|1|bob", "oops")
            .with_client_id("c1")
            .with_sender("me", true);

        let tombstone = CachedMessage::self_recall_tombstone(&original);

        assert_eq!(tombstone.client_id(), "recall-c1");
        assert_eq!(tombstone.message.message_type, MessageType::Custom);
        assert_eq!(tombstone.sending_state(), Some(SendingState::Succeeded));
        assert_eq!(
            tombstone.recall.as_ref().and_then(|r| r.original_text.as_deref()),
            Some("oops")
        );
        assert!(!tombstone.is_peer_recall());
    }

    #[test]
    fn peer_tombstone_is_flagged() {
        let refer = MessageRefer {
            conversation_id: "me|2|t".into(),
            client_id: "c9".into(),
            sender_id: "bob".into(),
            create_time: 7,
            ..Default::default()
        };

        let tombstone = CachedMessage::peer_recall_tombstone(&refer, "me");

        assert!(tombstone.is_peer_recall());
        assert!(!tombstone.display_sender.is_self);
        assert_eq!(tombstone.create_time(), 7);
        assert!(!tombstone.can_edit());
    }

    #[test]
    fn view_parses_conversation_type() {
        let view = ConversationView::new("me|3|big");
        assert_eq!(view.conversation_type, ConversationType::SuperTeam);
        assert!(view.mention_ids.is_empty());
    }
}
