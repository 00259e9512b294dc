//! Merge rules for the message cache.
//!
//! Every ingestion path (optimistic insert, push, acknowledgement, recall,
//! receipt) ends in [`CacheState::upsert`]; every removal ends in
//! [`CacheState::remove`]. Both run with the state lock held and never await.

use super::model::{CachedMessage, ConversationView, Receipt, Sender};
use crate::config::EngineConfig;
use crate::store::{PinRecord, PinTable, QueueMap, TrimDirection};
use msgsync_messaging::{AiStatus, Message, P2pReceipt, TeamReceipt};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub(crate) struct Session {
    pub account_id: String,
    /// Accounts known to be AI personas.
    pub ai_accounts: HashSet<String>,
    pub selected: Option<String>,
}

pub(crate) struct CacheState {
    pub session: Session,
    pub messages: QueueMap<CachedMessage>,
    pub pins: PinTable,
    /// Message being replied to, per conversation.
    pub reply_drafts: HashMap<String, Message>,
    pub conversations: HashMap<String, ConversationView>,
    /// Messages saved to the user's collections, by client id.
    pub collected: HashMap<String, Message>,
    pub disposed: bool,
}

impl CacheState {
    pub fn new(config: &EngineConfig, account_id: String) -> Self {
        Self {
            session: Session {
                account_id,
                ..Default::default()
            },
            messages: QueueMap::new(config.history_limit, TrimDirection::RightToLeft),
            pins: PinTable::new(config.pin_conversation_limit),
            reply_drafts: HashMap::new(),
            conversations: HashMap::new(),
            collected: HashMap::new(),
            disposed: false,
        }
    }

    pub fn is_selected(&self, conversation_id: &str) -> bool {
        self.session.selected.as_deref() == Some(conversation_id)
    }

    pub fn find(&self, conversation_id: &str, client_id: &str) -> Option<&CachedMessage> {
        self.messages
            .get(conversation_id)?
            .iter()
            .find(|m| m.client_id() == client_id)
    }

    pub fn view_mut(&mut self, conversation_id: &str) -> &mut ConversationView {
        self.conversations
            .entry(conversation_id.to_string())
            .or_insert_with(|| ConversationView::new(conversation_id))
    }

    /// Merge `incoming` into a conversation's queue by client id, keeping the
    /// queue sorted by `(create_time, client_id)`. Returns the client ids
    /// that were accepted for merging.
    pub fn upsert(&mut self, conversation_id: &str, incoming: Vec<CachedMessage>) -> Vec<String> {
        let mut entries = self
            .messages
            .get_mut(conversation_id)
            .map(std::mem::take)
            .unwrap_or_default();
        let pin_map = self.pins.get(conversation_id);
        let mut touched = Vec::with_capacity(incoming.len());

        for mut item in incoming.into_iter().filter(|m| !m.client_id().is_empty()) {
            item.display_sender = resolve_sender(&self.session, &item.message);
            if let Some(record) = pin_map.and_then(|pins| pins.get(item.client_id())) {
                item.pin_state = record.pin_state;
                item.pin_operator_id = Some(record.operator_id.clone());
            }
            touched.push(item.client_id().to_string());

            match entries.iter().position(|m| m.client_id() == item.client_id()) {
                Some(pos) => {
                    let existing = &entries[pos];
                    if existing.create_time() <= item.create_time() || existing.is_sending() {
                        carry_forward(existing, &mut item);
                        let replaced = std::mem::replace(&mut entries[pos], item);
                        release_superseded_timer(&replaced, &entries[pos]);
                    } else if let Some(timer) = item.edit_timer() {
                        if existing.edit_timer() != Some(timer) {
                            timer.cancel();
                        }
                    }
                }
                None => entries.push(item),
            }
        }

        entries.sort_by(|a, b| {
            a.create_time()
                .cmp(&b.create_time())
                .then_with(|| a.client_id().cmp(b.client_id()))
        });
        let no_limit = !self.is_selected(conversation_id);
        for evicted in self.messages.set(conversation_id, entries, no_limit) {
            evicted.cancel_timers();
        }
        touched
    }

    /// Remove cached messages, cancelling their timers.
    ///
    /// With no conversation every queue is cleared; with a conversation and no
    /// ids that conversation's queue is dropped. Peer-recall tombstones are
    /// never removed by id.
    pub fn remove(
        &mut self,
        conversation_id: Option<&str>,
        client_ids: &[String],
    ) -> Vec<CachedMessage> {
        let removed = match conversation_id {
            None => self.messages.clear(),
            Some(conversation_id) if client_ids.is_empty() => self
                .messages
                .delete(conversation_id)
                .unwrap_or_default(),
            Some(conversation_id) => {
                let Some(entries) = self.messages.get_mut(conversation_id) else {
                    return Vec::new();
                };
                let (removed, kept): (Vec<_>, Vec<_>) =
                    std::mem::take(entries).into_iter().partition(|m| {
                        client_ids.iter().any(|id| id == m.client_id()) && !m.is_peer_recall()
                    });
                *entries = kept;
                removed
            }
        };
        removed.iter().for_each(CachedMessage::cancel_timers);
        removed
    }

    /// Re-apply the history limit to one conversation, or to all of them.
    pub fn reset_limit_state(&mut self, conversation_id: Option<&str>) {
        let evicted = match conversation_id {
            Some(conversation_id) => self.messages.reset_limit_state_for(conversation_id),
            None => self.messages.reset_limit_state(),
        };
        evicted.iter().for_each(CachedMessage::cancel_timers);
    }

    /// Reflect pin records onto cached messages in place. Returns the ids of
    /// messages whose pin state changed.
    pub fn reflect_pin_states(
        &mut self,
        conversation_id: &str,
        records: &[PinRecord],
    ) -> Vec<String> {
        let Some(entries) = self.messages.get_mut(conversation_id) else {
            return Vec::new();
        };
        let mut changed = Vec::new();
        for record in records {
            if let Some(entry) = entries
                .iter_mut()
                .find(|m| m.client_id() == record.client_id())
            {
                if entry.pin_state != record.pin_state {
                    entry.pin_state = record.pin_state;
                    entry.pin_operator_id = Some(record.operator_id.clone());
                    changed.push(record.client_id().to_string());
                }
            }
        }
        changed
    }

    /// Apply one group receipt to the cached message it names.
    pub fn apply_team_receipt(&mut self, receipt: &TeamReceipt) -> bool {
        let Some(mut entry) = self
            .find(&receipt.conversation_id, &receipt.client_id)
            .cloned()
        else {
            return false;
        };
        entry.receipt = Some(Receipt {
            unread_count: receipt.unread_count,
            read_count: receipt.read_count,
        });
        self.upsert(&receipt.conversation_id, vec![entry]);
        true
    }

    /// Advance the peer-read time. Returns the new time when it moved.
    pub fn apply_p2p_receipt(&mut self, receipt: &P2pReceipt) -> Option<i64> {
        let view = self.view_mut(&receipt.conversation_id);
        if receipt.timestamp > view.msg_receipt_time {
            view.msg_receipt_time = receipt.timestamp;
            Some(receipt.timestamp)
        } else {
            None
        }
    }

    /// Drop everything tied to the logged-in session.
    pub fn clear(&mut self) {
        self.remove(None, &[]);
        self.pins.clear();
        self.reply_drafts.clear();
        self.conversations.clear();
        self.collected.clear();
        self.session.selected = None;
    }
}

/// AI replies are shown as coming from the persona that produced them.
pub(super) fn resolve_sender(session: &Session, message: &Message) -> Sender {
    let account_id = match &message.ai_config {
        Some(ai) if ai.status == AiStatus::Response => ai.account_id.clone(),
        _ => message.sender_id.clone(),
    };
    let is_self = account_id == session.account_id;
    Sender {
        account_id,
        is_self,
    }
}

/// Keep client-local enrichment a raw backend payload would otherwise erase.
fn carry_forward(existing: &CachedMessage, incoming: &mut CachedMessage) {
    if incoming.edit_window.is_none() {
        incoming.edit_window = existing.edit_window.clone();
    }
    if incoming.voice_text.is_none() {
        incoming.voice_text = existing.voice_text.clone();
    }
}

fn release_superseded_timer(replaced: &CachedMessage, current: &CachedMessage) {
    if let Some(timer) = replaced.edit_timer() {
        if current.edit_timer() != Some(timer) {
            timer.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::model::EditWindow;
    use crate::timer::ScheduledTask;
    use msgsync_messaging::{AiConfig, MessagePin, MessageRefer, PinState, SendingState};
    use std::time::Duration;

    const CONV: &str = "me|1|bob";

    fn state() -> CacheState {
        CacheState::new(&EngineConfig::default().with_history_limit(3), "me".into())
    }

    fn msg(client_id: &str, create_time: i64) -> CachedMessage {
        Message::text(CONV, client_id)
            .with_client_id(client_id)
            .with_sender("bob", false)
            .with_create_time(create_time)
            .into()
    }

    fn ids(state: &CacheState) -> Vec<String> {
        state
            .messages
            .get(CONV)
            .unwrap_or_default()
            .iter()
            .map(|m| m.client_id().to_string())
            .collect()
    }

    #[test]
    fn keeps_queue_sorted_with_client_id_tie_break() {
        let mut state = state();
        state.upsert(CONV, vec![msg("b", 5), msg("c", 1), msg("a", 5)]);
        assert_eq!(ids(&state), vec!["c", "a", "b"]);
    }

    #[test]
    fn background_conversations_are_not_truncated() {
        let mut state = state();
        state.upsert(CONV, (0..6).map(|i| msg(&format!("m{i}"), i)).collect());
        assert_eq!(ids(&state).len(), 6);

        state.session.selected = Some(CONV.into());
        state.reset_limit_state(Some(CONV));
        assert_eq!(ids(&state), vec!["m3", "m4", "m5"]);
    }

    #[test]
    fn selected_conversation_evicts_oldest() {
        let mut state = state();
        state.session.selected = Some(CONV.into());
        state.upsert(CONV, (0..5).map(|i| msg(&format!("m{i}"), i)).collect());
        assert_eq!(ids(&state), vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn duplicate_client_id_is_merged() {
        let mut state = state();
        state.upsert(CONV, vec![msg("c1", 10)]);
        let mut update = msg("c1", 10);
        update.message.text = Some("edited".into());
        state.upsert(CONV, vec![update]);

        let entries = state.messages.get(CONV).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message.text.as_deref(), Some("edited"));
    }

    #[test]
    fn stale_payload_does_not_replace_newer_entry() {
        let mut state = state();
        state.upsert(CONV, vec![msg("c1", 20)]);
        let mut stale = msg("c1", 10);
        stale.message.text = Some("stale".into());
        state.upsert(CONV, vec![stale]);

        assert_eq!(state.find(CONV, "c1").unwrap().create_time(), 20);
    }

    #[test]
    fn sending_entry_is_always_superseded() {
        let mut state = state();
        let mut sending = msg("c1", 20);
        sending.message.sending_state = Some(SendingState::Sending);
        state.upsert(CONV, vec![sending]);

        let mut acked = msg("c1", 10);
        acked.message.sending_state = Some(SendingState::Succeeded);
        state.upsert(CONV, vec![acked]);

        let entry = state.find(CONV, "c1").unwrap();
        assert_eq!(entry.sending_state(), Some(SendingState::Succeeded));
        assert_eq!(entry.create_time(), 10);
    }

    #[tokio::test]
    async fn enrichment_survives_raw_payloads() {
        let mut state = state();
        let timer = ScheduledTask::spawn(Duration::from_secs(60), || {});
        let mut first = msg("c1", 1);
        first.voice_text = Some("hello".into());
        first.edit_window = Some(EditWindow {
            can_edit: true,
            timer: Some(timer.clone()),
        });
        state.upsert(CONV, vec![first]);
        state.upsert(CONV, vec![msg("c1", 2)]);

        let entry = state.find(CONV, "c1").unwrap();
        assert_eq!(entry.voice_text.as_deref(), Some("hello"));
        assert!(entry.can_edit());
        assert!(!timer.is_cancelled());
    }

    #[tokio::test]
    async fn replaced_timer_is_cancelled() {
        let mut state = state();
        let old = ScheduledTask::spawn(Duration::from_secs(60), || {});
        let mut first = msg("c1", 1);
        first.edit_window = Some(EditWindow {
            can_edit: true,
            timer: Some(old.clone()),
        });
        state.upsert(CONV, vec![first]);

        let mut second = msg("c1", 2);
        second.edit_window = Some(EditWindow {
            can_edit: false,
            timer: None,
        });
        state.upsert(CONV, vec![second]);
        assert!(old.is_cancelled());
    }

    #[test]
    fn empty_client_ids_are_ignored() {
        let mut state = state();
        let touched = state.upsert(CONV, vec![msg("", 1), msg("ok", 2)]);
        assert_eq!(touched, vec!["ok"]);
        assert_eq!(ids(&state), vec!["ok"]);
    }

    #[test]
    fn ai_response_is_displayed_as_persona() {
        let mut state = state();
        let mut reply = Message::text(CONV, "answer")
            .with_client_id("ai1")
            .with_sender("me", true);
        reply.ai_config = Some(AiConfig::response("bot"));
        state.upsert(CONV, vec![reply.into()]);

        let entry = state.find(CONV, "ai1").unwrap();
        assert_eq!(entry.display_sender.account_id, "bot");
        assert!(!entry.display_sender.is_self);
        assert_eq!(entry.to_backend().sender_id, "me");
        assert!(entry.to_backend().is_self);
    }

    #[test]
    fn pin_table_annotates_incoming() {
        let mut state = state();
        state.pins.set(
            CONV,
            vec![PinRecord::from_pin(
                MessagePin {
                    message_refer: MessageRefer {
                        conversation_id: CONV.into(),
                        client_id: "c1".into(),
                        ..Default::default()
                    },
                    operator_id: "alice".into(),
                    ..Default::default()
                },
                PinState::Pinned,
            )],
        );
        state.upsert(CONV, vec![msg("c1", 1)]);

        let entry = state.find(CONV, "c1").unwrap();
        assert_eq!(entry.pin_state, PinState::Pinned);
        assert_eq!(entry.pin_operator_id.as_deref(), Some("alice"));
    }

    #[test]
    fn removal_by_id_spares_peer_tombstones() {
        let mut state = state();
        let refer = MessageRefer {
            conversation_id: CONV.into(),
            client_id: "gone".into(),
            sender_id: "bob".into(),
            create_time: 3,
            ..Default::default()
        };
        state.upsert(
            CONV,
            vec![
                msg("c1", 1),
                CachedMessage::peer_recall_tombstone(&refer, "me"),
            ],
        );

        let removed = state.remove(Some(CONV), &["c1".into(), "recall-gone".into()]);
        assert_eq!(removed.len(), 1);
        assert_eq!(ids(&state), vec!["recall-gone"]);
    }

    #[test]
    fn removal_scopes() {
        let mut state = state();
        state.upsert(CONV, vec![msg("c1", 1)]);
        state.upsert("me|1|carol", vec![msg("c2", 1)]);

        assert_eq!(state.remove(Some(CONV), &[]).len(), 1);
        assert!(state.messages.get(CONV).is_none());
        assert_eq!(state.remove(None, &[]).len(), 1);
        assert!(state.remove(Some("missing"), &["x".into()]).is_empty());
    }

    #[test]
    fn team_receipts_update_counts() {
        let mut state = state();
        state.upsert(CONV, vec![msg("m1", 1)]);
        let applied = state.apply_team_receipt(&TeamReceipt {
            conversation_id: CONV.into(),
            client_id: "m1".into(),
            server_id: None,
            read_count: 2,
            unread_count: 4,
        });

        assert!(applied);
        assert_eq!(
            state.find(CONV, "m1").unwrap().receipt,
            Some(Receipt {
                unread_count: 4,
                read_count: 2
            })
        );
    }

    #[test]
    fn p2p_receipt_time_never_regresses() {
        let mut state = state();
        let receipt = |timestamp| P2pReceipt {
            conversation_id: CONV.into(),
            timestamp,
        };
        assert_eq!(state.apply_p2p_receipt(&receipt(100)), Some(100));
        assert_eq!(state.apply_p2p_receipt(&receipt(50)), None);
        assert_eq!(state.conversations[CONV].msg_receipt_time, 100);
    }
}
