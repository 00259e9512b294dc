use super::reconcile::{resolve_sender, CacheState};
use msgsync_messaging::{Message, ServerExtension};
use tracing::debug;

impl CacheState {
    /// Record incoming group messages that mention the current user.
    ///
    /// A message is recorded only when it is newer than the conversation's
    /// read time, mentions the user or everyone, belongs to a conversation
    /// that is not selected, and was not sent by the user. AI replies count
    /// as sent by their persona. Returns the conversations whose mention
    /// list changed.
    pub fn record_mentions(&mut self, messages: &[Message], everyone: &str) -> Vec<String> {
        let mut changed = Vec::new();
        for message in messages {
            if !message.conversation_type.is_group() || message.client_id.is_empty() {
                continue;
            }
            let Some(raw) = message.server_extension.as_deref() else {
                continue;
            };
            let extension = match ServerExtension::parse(raw) {
                Ok(extension) => extension,
                Err(err) => {
                    debug!(%err, client_id = %message.client_id, "ignoring malformed extension");
                    continue;
                }
            };

            let mentioned = extension.mentions_account(&self.session.account_id, everyone);
            let from_me = resolve_sender(&self.session, message).is_self;
            let selected = self.is_selected(&message.conversation_id);
            let read_time = self
                .conversations
                .get(&message.conversation_id)
                .map_or(0, |view| view.read_time);

            if message.create_time > read_time && mentioned && !selected && !from_me {
                let view = self.view_mut(&message.conversation_id);
                if !view.mention_ids.contains(&message.client_id) {
                    view.mention_ids.push(message.client_id.clone());
                    changed.push(message.conversation_id.clone());
                }
            }
        }
        changed.dedup();
        changed
    }

    /// Drop a recalled message from the mention list.
    pub fn prune_mention(&mut self, conversation_id: &str, client_id: &str) -> bool {
        let Some(view) = self.conversations.get_mut(conversation_id) else {
            return false;
        };
        let before = view.mention_ids.len();
        view.mention_ids.retain(|id| id != client_id);
        view.mention_ids.len() != before
    }
}
