use super::model::CachedMessage;
use super::reconcile::CacheState;
use crate::backend::{AiContextMessage, AiRequest, AiRole};
use msgsync_messaging::{Message, MessageType, ServerExtension};

impl CacheState {
    /// AI relay parameters for an outgoing message, if it addresses an AI
    /// persona either as the direct peer or through an @-mention.
    ///
    /// Must be computed before the message itself is cached.
    pub fn ai_request_for(
        &self,
        message: &Message,
        reply: Option<&Message>,
        context_limit: usize,
        stream: bool,
    ) -> Option<AiRequest> {
        let extension = message
            .server_extension
            .as_deref()
            .and_then(|raw| ServerExtension::parse(raw).ok())
            .unwrap_or_default();
        let ai_accounts = &self.session.ai_accounts;

        let mut request = None;
        if ai_accounts.contains(&message.receiver_id) {
            request = Some(if message.message_type == MessageType::Text {
                let history = self
                    .messages
                    .get(&message.conversation_id)
                    .unwrap_or_default();
                AiRequest {
                    account_id: message.receiver_id.clone(),
                    content: Some(message.text.clone().unwrap_or_default()),
                    messages: Some(context_window(
                        history,
                        &self.session.account_id,
                        context_limit,
                    )),
                    stream,
                }
            } else {
                AiRequest {
                    account_id: message.receiver_id.clone(),
                    content: None,
                    messages: None,
                    stream,
                }
            });
        }

        if let Some(account) = extension.earliest_mention(|account| ai_accounts.contains(account)) {
            request = Some(AiRequest {
                account_id: account.to_string(),
                content: Some(message.text.clone().unwrap_or_default()),
                messages: None,
                stream,
            });
        }

        let mut request = request?;
        if let Some(reply) = reply {
            request.messages = (reply.message_type == MessageType::Text).then(|| {
                vec![AiContextMessage {
                    role: AiRole::User,
                    text: reply.text.clone().unwrap_or_default(),
                }]
            });
        }
        Some(request)
    }
}

/// The last `limit` text messages, starting from the first one the user sent.
/// Leading persona turns with no user turn before them are dropped.
pub(crate) fn context_window(
    history: &[CachedMessage],
    my_account_id: &str,
    limit: usize,
) -> Vec<AiContextMessage> {
    let texts: Vec<&Message> = history
        .iter()
        .map(|entry| &entry.message)
        .filter(|m| m.message_type == MessageType::Text)
        .collect();
    let recent = &texts[texts.len().saturating_sub(limit)..];
    let Some(start) = recent.iter().position(|m| m.sender_id == my_account_id) else {
        return Vec::new();
    };

    recent[start..]
        .iter()
        .map(|m| AiContextMessage {
            role: if m.sender_id == my_account_id {
                AiRole::User
            } else {
                AiRole::Assistant
            },
            text: m.text.clone().unwrap_or_default(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    const BOT_CHAT: &str = "me|1|bot";

    fn state() -> CacheState {
        let mut state = CacheState::new(&EngineConfig::default(), "me".into());
        state.session.ai_accounts.insert("bot".into());
        state
    }

    fn text(client_id: &str, sender: &str, body: &str, create_time: i64) -> CachedMessage {
        Message::text(BOT_CHAT, body)
            .with_client_id(client_id)
            .with_sender(sender, sender == "me")
            .with_create_time(create_time)
            .into()
    }

    fn outgoing(body: &str) -> Message {
        let mut message = Message::text(BOT_CHAT, body).with_sender("me", true);
        message.receiver_id = "bot".into();
        message
    }

    #[test]
    fn window_drops_leading_assistant_turns() {
        let history = vec![
            text("a", "bot", "welcome", 1),
            text("b", "me", "q1", 2),
            text("c", "bot", "a1", 3),
        ];
        let window = context_window(&history, "me", 30);
        let roles: Vec<_> = window.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![AiRole::User, AiRole::Assistant]);
        assert_eq!(window[0].text, "q1");
    }

    #[test]
    fn window_counts_only_text_messages() {
        let mut image: CachedMessage = Message::new(BOT_CHAT, MessageType::Image)
            .with_client_id("img")
            .with_sender("me", true)
            .with_create_time(4)
            .into();
        image.message.text = None;
        let history = vec![
            text("a", "me", "q1", 1),
            text("b", "bot", "a1", 2),
            text("c", "me", "q2", 3),
            image,
        ];
        let window = context_window(&history, "me", 2);
        let texts: Vec<_> = window.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["q2"]);
    }

    #[test]
    fn window_is_empty_without_user_turn() {
        let history = vec![text("a", "bot", "hello", 1)];
        assert!(context_window(&history, "me", 30).is_empty());
    }

    #[test]
    fn direct_ai_chat_carries_history() {
        let mut state = state();
        state.upsert(
            BOT_CHAT,
            vec![text("a", "me", "q1", 1), text("b", "bot", "a1", 2)],
        );

        let request = state
            .ai_request_for(&outgoing("q2"), None, 30, true)
            .unwrap();
        assert_eq!(request.account_id, "bot");
        assert_eq!(request.content.as_deref(), Some("q2"));
        assert_eq!(request.messages.unwrap().len(), 2);
        assert!(request.stream);
    }

    #[test]
    fn reply_replaces_window_with_single_turn() {
        let state = state();
        let replied = Message::text(BOT_CHAT, "earlier question");

        let request = state
            .ai_request_for(&outgoing("follow up"), Some(&replied), 30, false)
            .unwrap();
        let messages = request.messages.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, AiRole::User);
        assert_eq!(messages[0].text, "earlier question");

        let image = Message::new(BOT_CHAT, MessageType::Image);
        let request = state
            .ai_request_for(&outgoing("about this"), Some(&image), 30, false)
            .unwrap();
        assert!(request.messages.is_none());
    }

    #[test]
    fn group_mention_of_persona_uses_earliest() {
        let mut state = state();
        state.session.ai_accounts.insert("helper".into());
        let extension = ServerExtension::parse(
            r#"{"yxAitMsg":{
                "helper":{"text":"@helper","segments":[{"start":8,"end":15}]},
                "bot":{"text":"@bot","segments":[{"start":0,"end":4}]},
                "carol":{"text":"@carol","segments":[{"start":0,"end":0}]}
            }}"#,
        )
        .unwrap();
        let mut message = Message::text("me|2|t1", "@bot and @helper").with_extension(&extension);
        message.receiver_id = "t1".into();

        let request = state.ai_request_for(&message, None, 30, false).unwrap();
        assert_eq!(request.account_id, "bot");
        assert!(request.messages.is_none());
    }

    #[test]
    fn plain_messages_need_no_ai() {
        let state = state();
        let mut message = Message::text("me|1|bob", "hi");
        message.receiver_id = "bob".into();
        assert!(state.ai_request_for(&message, None, 30, false).is_none());
    }
}
