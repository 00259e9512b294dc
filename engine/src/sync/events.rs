//! Backend push handling.

use super::model::{recall_id, CachedMessage};
use super::{CacheEvent, ListenerHandle, MessageSyncEngine};
use crate::backend::BackendEvent;
use crate::store::PinRecord;
use msgsync_messaging::{
    ClearHistoryNotification, ConversationSnapshot, DeletedNotification, Message, P2pReceipt,
    PinNotification, RevokeNotification, TeamReceipt,
};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

impl MessageSyncEngine {
    /// Consume backend pushes on a background task until the channel closes
    /// or the engine is disposed. Replaces any previous listener.
    pub fn listen(&self, mut events: mpsc::Receiver<BackendEvent>) {
        let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();
        let engine = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        let Some(inner) = engine.upgrade() else { break };
                        MessageSyncEngine { inner }.handle_event(event).await;
                    }
                }
            }
            debug!("backend listener stopped");
        });

        let previous = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(ListenerHandle { shutdown, task });
        if let Some(previous) = previous {
            let _ = previous.shutdown.send(());
            previous.task.abort();
        }
        info!("listening for backend events");
    }

    /// Apply a single backend push. Ignored once the engine is disposed.
    pub async fn handle_event(&self, event: BackendEvent) {
        if self.is_disposed() {
            return;
        }
        match event {
            BackendEvent::MessagesReceived(messages) => self.on_received(messages),
            BackendEvent::MessagesModified(messages) => self.on_modified(messages),
            BackendEvent::MessagesDeleted(deleted) => self.on_deleted(deleted),
            BackendEvent::MessagesRevoked(revoked) => self.on_revoked(revoked),
            BackendEvent::PinChanged(notification) => self.on_pin_changed(notification).await,
            BackendEvent::P2pReceipts(receipts) => self.on_p2p_receipts(receipts),
            BackendEvent::TeamReceipts(receipts) => self.apply_team_receipts(receipts),
            BackendEvent::HistoryCleared(cleared) => self.on_history_cleared(cleared),
            BackendEvent::ConversationsChanged(snapshots) => {
                self.on_conversations_changed(snapshots).await
            }
        }
    }

    fn on_received(&self, messages: Vec<Message>) {
        debug!(count = messages.len(), "messages received");
        let mut state = self.lock();
        for (conversation_id, batch) in by_conversation(&messages) {
            let upserted = state.upsert(
                &conversation_id,
                batch.into_iter().cloned().map(CachedMessage::from).collect(),
            );
            self.notify_upserted(&conversation_id, upserted);
        }
        let everyone = self.config().mention_all_account.clone();
        let changed = state.record_mentions(&messages, &everyone);
        self.notify_mentions(&state, changed);
    }

    fn on_modified(&self, messages: Vec<Message>) {
        debug!(count = messages.len(), "messages modified");
        let mut state = self.lock();
        for (conversation_id, batch) in by_conversation(&messages) {
            let upserted = state.upsert(
                &conversation_id,
                batch.into_iter().cloned().map(CachedMessage::from).collect(),
            );
            self.notify_upserted(&conversation_id, upserted);
        }
    }

    fn on_deleted(&self, deleted: Vec<DeletedNotification>) {
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for notification in deleted {
            let refer = notification.message_refer;
            grouped
                .entry(refer.conversation_id)
                .or_default()
                .push(refer.client_id);
        }

        let mut state = self.lock();
        for (conversation_id, client_ids) in grouped {
            debug!(%conversation_id, count = client_ids.len(), "messages deleted remotely");
            state.pins.delete(&conversation_id, &client_ids);
            let removed = state.remove(Some(&conversation_id), &client_ids);
            self.notify_removed(Some(&conversation_id), &client_ids, removed);
        }
    }

    fn on_revoked(&self, revoked: Vec<RevokeNotification>) {
        for notification in revoked {
            let refer = &notification.message_refer;
            let conversation_id = refer.conversation_id.clone();
            let client_id = refer.client_id.clone();
            let me = self.account_id();

            if self.recall_applied(&conversation_id, &client_id) {
                debug!(%conversation_id, %client_id, "recall already applied");
                continue;
            }

            let tombstone = match &notification.message {
                Some(message) if message.sender_id == me => self.self_recall_tombstone(message),
                _ => CachedMessage::peer_recall_tombstone(refer, &me),
            };

            let mut state = self.lock();
            let client_ids = [client_id.clone()];
            state.pins.delete(&conversation_id, &client_ids);
            let removed = state.remove(Some(&conversation_id), &client_ids);
            self.notify_removed(Some(&conversation_id), &client_ids, removed);
            let upserted = state.upsert(&conversation_id, vec![tombstone]);
            self.notify_upserted(&conversation_id, upserted);

            if refer.conversation_type.is_group() && state.prune_mention(&conversation_id, &client_id)
            {
                self.notify_mentions(&state, vec![conversation_id.clone()]);
            }
            info!(%conversation_id, %client_id, revoked_by = %notification.revoke_account_id, "message recalled remotely");
        }
    }

    fn recall_applied(&self, conversation_id: &str, client_id: &str) -> bool {
        let state = self.lock();
        let marked = state
            .find(conversation_id, client_id)
            .is_some_and(|m| m.recall.is_some());
        marked || state.find(conversation_id, &recall_id(client_id)).is_some()
    }

    async fn on_pin_changed(&self, notification: PinNotification) {
        let PinNotification { pin_state, pin } = notification;
        let conversation_id = pin.message_refer.conversation_id.clone();
        let client_id = pin.message_refer.client_id.clone();

        let (existing, cached) = {
            let mut state = self.lock();
            let Some(pins) = state.pins.get(&conversation_id) else {
                debug!(%conversation_id, "pin change for untracked conversation");
                return;
            };
            let existing = pins.get(&client_id).cloned();
            let cached = state
                .find(&conversation_id, &client_id)
                .map(CachedMessage::to_backend);
            (existing, cached)
        };

        let mut record = PinRecord::from_pin(pin, pin_state);
        if let Some(existing) = &existing {
            record.create_time = record.create_time.min(existing.create_time);
            record.message = existing.message.clone();
        }
        if record.message.is_none() {
            record.message = cached;
        }
        let record = if record.pin_state.is_pinned() {
            self.complete_pins(vec![record]).await.into_iter().next()
        } else {
            Some(record)
        };

        let mut state = self.lock();
        if !state.pins.contains(&conversation_id) {
            debug!(%conversation_id, "conversation evicted from pin table while completing");
            return;
        }
        let Some(record) = record else {
            return;
        };
        let records = vec![record];
        state.pins.set(&conversation_id, records.clone());
        let changed = state.reflect_pin_states(&conversation_id, &records);
        self.notify_upserted(&conversation_id, changed);
        self.emit(CacheEvent::PinsChanged { conversation_id });
    }

    fn on_p2p_receipts(&self, receipts: Vec<P2pReceipt>) {
        let mut state = self.lock();
        for receipt in receipts {
            if let Some(timestamp) = state.apply_p2p_receipt(&receipt) {
                self.emit(CacheEvent::ReceiptTimeChanged {
                    conversation_id: receipt.conversation_id,
                    timestamp,
                });
            }
        }
    }

    /// Apply group read counts. Receipts are applied in ascending read-count
    /// order so the largest count for a message wins.
    pub(super) fn apply_team_receipts(&self, mut receipts: Vec<TeamReceipt>) {
        if receipts.is_empty() {
            return;
        }
        receipts.sort_by_key(|r| r.read_count);
        let mut touched: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut state = self.lock();
        for receipt in &receipts {
            if state.apply_team_receipt(receipt) {
                let ids = touched.entry(receipt.conversation_id.clone()).or_default();
                if !ids.contains(&receipt.client_id) {
                    ids.push(receipt.client_id.clone());
                }
            }
        }
        for (conversation_id, client_ids) in touched {
            self.notify_upserted(&conversation_id, client_ids);
        }
    }

    fn on_history_cleared(&self, cleared: Vec<ClearHistoryNotification>) {
        let mut state = self.lock();
        for notification in cleared {
            let conversation_id = notification.conversation_id;
            info!(%conversation_id, "history cleared remotely");
            let removed = state.remove(Some(&conversation_id), &[]);
            self.notify_removed(Some(&conversation_id), &[], removed);
            if let Some(view) = state.conversations.get_mut(&conversation_id) {
                if !view.mention_ids.is_empty() {
                    view.mention_ids.clear();
                    self.notify_mentions(&state, vec![conversation_id]);
                }
            }
        }
    }

    async fn on_conversations_changed(&self, snapshots: Vec<ConversationSnapshot>) {
        let mut mark_read = Vec::new();
        {
            let mut state = self.lock();
            for snapshot in snapshots {
                let conversation_id = snapshot.conversation_id;
                let selected = state.is_selected(&conversation_id);
                let view = state.view_mut(&conversation_id);
                view.conversation_type = snapshot.conversation_type;
                view.unread_count = snapshot.unread_count;
                view.read_time = view.read_time.max(snapshot.read_time);
                let mentions_cleared = snapshot.unread_count == 0 && !view.mention_ids.is_empty();
                if mentions_cleared {
                    view.mention_ids.clear();
                }
                if selected && snapshot.unread_count > 0 {
                    mark_read.push(conversation_id.clone());
                }

                self.emit(CacheEvent::ConversationChanged {
                    conversation_id: conversation_id.clone(),
                });
                if mentions_cleared {
                    self.notify_mentions(&state, vec![conversation_id]);
                }
            }
        }

        for conversation_id in mark_read {
            if let Err(err) = self.mark_conversation_read(&conversation_id).await {
                warn!(%err, %conversation_id, "could not mark selected conversation read");
            }
        }
    }
}

fn by_conversation(messages: &[Message]) -> BTreeMap<String, Vec<&Message>> {
    let mut grouped: BTreeMap<String, Vec<&Message>> = BTreeMap::new();
    for message in messages {
        grouped
            .entry(message.conversation_id.clone())
            .or_default()
            .push(message);
    }
    grouped
}
