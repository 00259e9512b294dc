//! In-memory backend used by the demo binary and the test suite.

use super::{
    AiRegenerate, AiStreamStop, BackendError, BackendEvent, BackendResult, HistoryQuery,
    ImBackend, ProgressSink, SendParams, VoiceToTextRequest,
};
use async_trait::async_trait;
use msgsync_messaging::{
    now_ms, AddCollectionParams, AiStreamStatus, Collection, CollectionQuery, Message, MessagePin,
    MessageRefer, P2pReceipt, PinNotification, PinState, RevokeNotification, SendingState,
    TeamReceipt, TeamReceiptDetail,
};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Default)]
struct LoopbackState {
    next_server_id: u64,
    calls: Vec<String>,
    failures: HashMap<String, i32>,
    history: HashMap<String, Vec<Message>>,
    pins: HashMap<String, Vec<MessagePin>>,
    team_receipts: HashMap<String, TeamReceipt>,
    team_receipt_details: HashMap<String, TeamReceiptDetail>,
    collections: Vec<Collection>,
    ai_reply: Option<String>,
    p2p_receipts: HashMap<String, i64>,
    voice_text: Option<String>,
    last_send_params: Option<SendParams>,
}

/// Backend that acknowledges everything locally.
///
/// Sends are stored per conversation and given sequential server ids. Pin and
/// revoke requests are echoed back as push events when an event channel is
/// attached, the way a real server notifies every logged-in device.
pub struct LoopbackBackend {
    account_id: String,
    state: Mutex<LoopbackState>,
    events: Option<mpsc::Sender<BackendEvent>>,
}

impl LoopbackBackend {
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            state: Mutex::new(LoopbackState::default()),
            events: None,
        }
    }

    /// Echo pin and revoke operations on `events`.
    pub fn with_events(mut self, events: mpsc::Sender<BackendEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Reject the next call to `operation` with `code`.
    pub fn fail_next(&self, operation: &str, code: i32) {
        self.lock().failures.insert(operation.to_string(), code);
    }

    /// Operation names in call order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn last_send_params(&self) -> Option<SendParams> {
        self.lock().last_send_params.clone()
    }

    pub fn seed_history(&self, conversation_id: &str, messages: Vec<Message>) {
        self.lock()
            .history
            .entry(conversation_id.to_string())
            .or_default()
            .extend(messages);
    }

    pub fn seed_pin(&self, pin: MessagePin) {
        self.lock()
            .pins
            .entry(pin.message_refer.conversation_id.clone())
            .or_default()
            .push(pin);
    }

    pub fn set_team_receipt(&self, receipt: TeamReceipt) {
        self.lock()
            .team_receipts
            .insert(receipt.client_id.clone(), receipt);
    }

    pub fn set_team_receipt_detail(&self, detail: TeamReceiptDetail) {
        self.lock()
            .team_receipt_details
            .insert(detail.client_id.clone(), detail);
    }

    /// Text the persona produces when asked to regenerate a reply.
    pub fn set_ai_reply(&self, text: impl Into<String>) {
        self.lock().ai_reply = Some(text.into());
    }

    pub fn set_p2p_receipt(&self, conversation_id: &str, timestamp: i64) {
        self.lock()
            .p2p_receipts
            .insert(conversation_id.to_string(), timestamp);
    }

    pub fn set_voice_text(&self, text: impl Into<String>) {
        self.lock().voice_text = Some(text.into());
    }

    /// Messages the backend currently holds for a conversation.
    pub fn stored(&self, conversation_id: &str) -> Vec<Message> {
        self.lock()
            .history
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self, operation: &str) -> BackendResult<MutexGuard<'_, LoopbackState>> {
        let mut state = self.lock();
        state.calls.push(operation.to_string());
        if let Some(code) = state.failures.remove(operation) {
            debug!(operation, code, "loopback rejecting request");
            return Err(BackendError::new(code, format!("{operation} rejected")));
        }
        Ok(state)
    }

    async fn push(&self, event: BackendEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event).await;
        }
    }

    fn acknowledge(&self, state: &mut LoopbackState, mut message: Message) -> Message {
        message.server_id = Some(format!("srv-{}", Self::next_id(state)));
        message.sending_state = Some(SendingState::Succeeded);
        if let Some(attachment) = message.attachment.as_mut() {
            if attachment.url.is_none() {
                attachment.url = Some(format!("loopback://{}", message.client_id));
            }
        }
        let stored = state
            .history
            .entry(message.conversation_id.clone())
            .or_default();
        stored.retain(|m| m.client_id != message.client_id);
        stored.push(message.clone());
        message
    }

    fn next_id(state: &mut LoopbackState) -> u64 {
        state.next_server_id += 1;
        state.next_server_id
    }

    fn stored_mut<'a>(state: &'a mut LoopbackState, message: &Message) -> Option<&'a mut Message> {
        state
            .history
            .get_mut(&message.conversation_id)?
            .iter_mut()
            .find(|m| m.client_id == message.client_id)
    }

    fn pin_of(&self, message: &Message, server_extension: Option<String>) -> MessagePin {
        MessagePin {
            message_refer: message.refer(),
            operator_id: self.account_id.clone(),
            server_extension,
            create_time: now_ms(),
            update_time: now_ms(),
        }
    }
}

#[async_trait]
impl ImBackend for LoopbackBackend {
    async fn send_message(
        &self,
        mut message: Message,
        conversation_id: &str,
        params: SendParams,
        progress: Option<ProgressSink>,
    ) -> BackendResult<Message> {
        let acknowledged = {
            let mut state = self.begin("send_message")?;
            state.last_send_params = Some(params);
            message.conversation_id = conversation_id.to_string();
            self.acknowledge(&mut state, message)
        };
        if let Some(progress) = progress {
            if acknowledged.attachment.is_some() {
                progress(50);
                progress(100);
            }
        }
        Ok(acknowledged)
    }

    async fn reply_message(
        &self,
        mut message: Message,
        replied: Message,
        params: SendParams,
    ) -> BackendResult<Message> {
        let mut state = self.begin("reply_message")?;
        state.last_send_params = Some(params);
        message.thread_reply = Some(replied.refer());
        Ok(self.acknowledge(&mut state, message))
    }

    async fn cancel_attachment_upload(&self, message: &Message) -> BackendResult<()> {
        let mut state = self.begin("cancel_attachment_upload")?;
        if let Some(stored) = state.history.get_mut(&message.conversation_id) {
            stored.retain(|m| m.client_id != message.client_id);
        }
        Ok(())
    }

    async fn revoke_message(&self, message: &Message) -> BackendResult<()> {
        {
            let mut state = self.begin("revoke_message")?;
            if let Some(stored) = state.history.get_mut(&message.conversation_id) {
                stored.retain(|m| m.client_id != message.client_id);
            }
        }
        self.push(BackendEvent::MessagesRevoked(vec![RevokeNotification {
            message_refer: message.refer(),
            message: Some(message.clone()),
            revoke_account_id: self.account_id.clone(),
            server_extension: None,
        }]))
        .await;
        Ok(())
    }

    async fn delete_messages(&self, messages: &[Message]) -> BackendResult<()> {
        let mut state = self.begin("delete_messages")?;
        for message in messages {
            if let Some(stored) = state.history.get_mut(&message.conversation_id) {
                stored.retain(|m| m.client_id != message.client_id);
            }
        }
        Ok(())
    }

    async fn pin_message(
        &self,
        message: &Message,
        server_extension: Option<String>,
    ) -> BackendResult<()> {
        let pin = self.pin_of(message, server_extension);
        {
            let mut state = self.begin("pin_message")?;
            let pins = state
                .pins
                .entry(message.conversation_id.clone())
                .or_default();
            pins.retain(|p| p.message_refer.client_id != message.client_id);
            pins.push(pin.clone());
        }
        self.push(BackendEvent::PinChanged(PinNotification {
            pin_state: PinState::Pinned,
            pin,
        }))
        .await;
        Ok(())
    }

    async fn unpin_message(
        &self,
        refer: &MessageRefer,
        server_extension: Option<String>,
    ) -> BackendResult<()> {
        {
            let mut state = self.begin("unpin_message")?;
            if let Some(pins) = state.pins.get_mut(&refer.conversation_id) {
                pins.retain(|p| p.message_refer.client_id != refer.client_id);
            }
        }
        self.push(BackendEvent::PinChanged(PinNotification {
            pin_state: PinState::NotPinned,
            pin: MessagePin {
                message_refer: refer.clone(),
                operator_id: self.account_id.clone(),
                server_extension,
                ..Default::default()
            },
        }))
        .await;
        Ok(())
    }

    async fn update_pin_message(
        &self,
        message: &Message,
        server_extension: Option<String>,
    ) -> BackendResult<()> {
        let pin = self.pin_of(message, server_extension);
        {
            let mut state = self.begin("update_pin_message")?;
            if let Some(existing) = state
                .pins
                .get_mut(&message.conversation_id)
                .and_then(|pins| {
                    pins.iter_mut()
                        .find(|p| p.message_refer.client_id == message.client_id)
                })
            {
                existing.server_extension = pin.server_extension.clone();
                existing.update_time = pin.update_time;
            }
        }
        self.push(BackendEvent::PinChanged(PinNotification {
            pin_state: PinState::Updated,
            pin,
        }))
        .await;
        Ok(())
    }

    async fn get_pinned_messages(&self, conversation_id: &str) -> BackendResult<Vec<MessagePin>> {
        let state = self.begin("get_pinned_messages")?;
        Ok(state.pins.get(conversation_id).cloned().unwrap_or_default())
    }

    async fn get_messages_by_refers(&self, refers: &[MessageRefer]) -> BackendResult<Vec<Message>> {
        let state = self.begin("get_messages_by_refers")?;
        Ok(refers
            .iter()
            .filter_map(|refer| {
                state
                    .history
                    .get(&refer.conversation_id)?
                    .iter()
                    .find(|m| m.client_id == refer.client_id)
                    .cloned()
            })
            .collect())
    }

    async fn get_message_list(&self, query: HistoryQuery) -> BackendResult<Vec<Message>> {
        let state = self.begin("get_message_list")?;
        let mut messages: Vec<Message> = state
            .history
            .get(&query.conversation_id)
            .map(|stored| {
                stored
                    .iter()
                    .filter(|m| query.end_time == 0 || m.create_time <= query.end_time)
                    .filter(|m| {
                        query
                            .anchor
                            .as_ref()
                            .map_or(true, |anchor| m.create_time < anchor.create_time)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        messages.sort_by_key(|m| m.create_time);
        let skip = messages.len().saturating_sub(query.limit);
        Ok(messages.split_off(skip))
    }

    async fn get_team_receipts(&self, messages: &[Message]) -> BackendResult<Vec<TeamReceipt>> {
        let state = self.begin("get_team_receipts")?;
        Ok(messages
            .iter()
            .filter_map(|m| state.team_receipts.get(&m.client_id).cloned())
            .collect())
    }

    async fn get_p2p_receipt(&self, conversation_id: &str) -> BackendResult<P2pReceipt> {
        let state = self.begin("get_p2p_receipt")?;
        Ok(P2pReceipt {
            conversation_id: conversation_id.to_string(),
            timestamp: state.p2p_receipts.get(conversation_id).copied().unwrap_or(0),
        })
    }

    async fn send_p2p_receipt(&self, _message: &Message) -> BackendResult<()> {
        self.begin("send_p2p_receipt").map(drop)
    }

    async fn send_team_receipts(&self, _messages: &[Message]) -> BackendResult<()> {
        self.begin("send_team_receipts").map(drop)
    }

    async fn clear_unread_count(&self, _conversation_id: &str) -> BackendResult<()> {
        self.begin("clear_unread_count").map(drop)
    }

    async fn voice_to_text(&self, _request: VoiceToTextRequest) -> BackendResult<String> {
        let state = self.begin("voice_to_text")?;
        Ok(state.voice_text.clone().unwrap_or_default())
    }

    async fn stop_ai_stream(&self, message: &Message, stop: AiStreamStop) -> BackendResult<()> {
        let event = {
            let mut state = self.begin("stop_ai_stream")?;
            if stop == AiStreamStop::Revoke {
                if let Some(stored) = state.history.get_mut(&message.conversation_id) {
                    stored.retain(|m| m.client_id != message.client_id);
                }
                BackendEvent::MessagesRevoked(vec![RevokeNotification {
                    message_refer: message.refer(),
                    message: Some(message.clone()),
                    revoke_account_id: self.account_id.clone(),
                    server_extension: None,
                }])
            } else {
                let mut stopped = Self::stored_mut(&mut state, message)
                    .cloned()
                    .unwrap_or_else(|| message.clone());
                if let Some(ai) = stopped.ai_config.as_mut() {
                    ai.stream_status = Some(AiStreamStatus::Cancelled);
                }
                if let AiStreamStop::Replace(text) = stop {
                    stopped.text = Some(text);
                }
                if let Some(stored) = Self::stored_mut(&mut state, message) {
                    *stored = stopped.clone();
                }
                BackendEvent::MessagesModified(vec![stopped])
            }
        };
        self.push(event).await;
        Ok(())
    }

    async fn regenerate_ai_message(
        &self,
        message: &Message,
        mode: AiRegenerate,
    ) -> BackendResult<()> {
        let event = {
            let mut state = self.begin("regenerate_ai_message")?;
            let mut reply = message.clone();
            reply.text = state.ai_reply.clone().or(reply.text);
            if let Some(ai) = reply.ai_config.as_mut() {
                ai.stream_status = ai.stream_status.map(|_| AiStreamStatus::Completed);
            }
            match mode {
                AiRegenerate::Update => {
                    if let Some(stored) = Self::stored_mut(&mut state, message) {
                        *stored = reply.clone();
                    }
                    BackendEvent::MessagesModified(vec![reply])
                }
                AiRegenerate::New => {
                    let id = Self::next_id(&mut state);
                    reply.client_id = format!("ai-{id}");
                    reply.server_id = Some(format!("srv-{id}"));
                    reply.create_time = now_ms();
                    state
                        .history
                        .entry(reply.conversation_id.clone())
                        .or_default()
                        .push(reply.clone());
                    BackendEvent::MessagesReceived(vec![reply])
                }
            }
        };
        self.push(event).await;
        Ok(())
    }

    async fn get_team_receipt_details(
        &self,
        message: &Message,
        member_ids: Option<&[String]>,
    ) -> BackendResult<TeamReceiptDetail> {
        let state = self.begin("get_team_receipt_details")?;
        let mut detail = state
            .team_receipt_details
            .get(&message.client_id)
            .cloned()
            .unwrap_or_else(|| TeamReceiptDetail {
                conversation_id: message.conversation_id.clone(),
                client_id: message.client_id.clone(),
                ..Default::default()
            });
        if let Some(members) = member_ids {
            detail.read_account_ids.retain(|id| members.contains(id));
            detail.unread_account_ids.retain(|id| members.contains(id));
        }
        Ok(detail)
    }

    async fn add_collection(&self, params: AddCollectionParams) -> BackendResult<Collection> {
        let mut state = self.begin("add_collection")?;
        if let Some(existing) = params.unique_id.as_ref().and_then(|key| {
            state
                .collections
                .iter()
                .find(|c| c.unique_id.as_ref() == Some(key))
        }) {
            return Ok(existing.clone());
        }
        let now = now_ms();
        let collection = Collection {
            collection_id: format!("col-{}", Self::next_id(&mut state)),
            collection_type: params.collection_type,
            collection_data: params.collection_data,
            unique_id: params.unique_id,
            server_extension: params.server_extension,
            create_time: now,
            update_time: now,
        };
        state.collections.push(collection.clone());
        Ok(collection)
    }

    async fn remove_collections(&self, collections: &[Collection]) -> BackendResult<usize> {
        let mut state = self.begin("remove_collections")?;
        let before = state.collections.len();
        state
            .collections
            .retain(|c| !collections.iter().any(|r| r.collection_id == c.collection_id));
        Ok(before - state.collections.len())
    }

    async fn get_collections(&self, query: CollectionQuery) -> BackendResult<Vec<Collection>> {
        let state = self.begin("get_collections")?;
        let mut found: Vec<Collection> = state
            .collections
            .iter()
            .filter(|c| query.matches(c))
            .cloned()
            .collect();
        found.sort_by_key(|c| std::cmp::Reverse(c.create_time));
        found.truncate(query.limit);
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use msgsync_messaging::Attachment;

    #[tokio::test]
    async fn send_assigns_server_ids_and_stores() {
        let backend = LoopbackBackend::new("me");
        let message = Message::text("me|1|bob", "hi").with_client_id("c1");

        let acked = backend
            .send_message(message, "me|1|bob", SendParams::default(), None)
            .await
            .unwrap();

        assert_eq!(acked.server_id.as_deref(), Some("srv-1"));
        assert_eq!(acked.sending_state, Some(SendingState::Succeeded));
        assert_eq!(backend.stored("me|1|bob").len(), 1);
    }

    #[tokio::test]
    async fn fail_next_rejects_once() {
        let backend = LoopbackBackend::new("me");
        backend.fail_next("send_message", 500);
        let message = Message::text("me|1|bob", "hi");

        let err = backend
            .send_message(message.clone(), "me|1|bob", SendParams::default(), None)
            .await
            .unwrap_err();
        assert_eq!(err.code, 500);

        assert!(backend
            .send_message(message, "me|1|bob", SendParams::default(), None)
            .await
            .is_ok());
        assert_eq!(backend.calls(), vec!["send_message", "send_message"]);
    }

    #[tokio::test]
    async fn attachments_get_urls_and_progress() {
        let backend = LoopbackBackend::new("me");
        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let sink_seen = std::sync::Arc::clone(&seen);
        let sink: ProgressSink = std::sync::Arc::new(move |pct| {
            sink_seen.lock().unwrap().push(pct);
        });
        let message = Message::new("me|1|bob", msgsync_messaging::MessageType::Image)
            .with_attachment(Attachment::default());

        let acked = backend
            .send_message(message, "me|1|bob", SendParams::default(), Some(sink))
            .await
            .unwrap();

        assert!(acked.attachment.unwrap().url.is_some());
        assert_eq!(*seen.lock().unwrap(), vec![50, 100]);
    }

    #[tokio::test]
    async fn pin_echoes_notification() {
        let (tx, mut rx) = mpsc::channel(4);
        let backend = LoopbackBackend::new("me").with_events(tx);
        let message = Message::text("me|2|team", "hi").with_client_id("c1");

        backend.pin_message(&message, None).await.unwrap();

        match rx.recv().await {
            Some(BackendEvent::PinChanged(n)) => {
                assert_eq!(n.pin_state, PinState::Pinned);
                assert_eq!(n.pin.operator_id, "me");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(backend.get_pinned_messages("me|2|team").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn history_respects_anchor_and_limit() {
        let backend = LoopbackBackend::new("me");
        let conv = "me|1|bob";
        backend.seed_history(
            conv,
            (1..=5)
                .map(|i| Message::text(conv, format!("m{i}")).with_client_id(format!("c{i}")).with_create_time(i))
                .collect(),
        );
        let anchor = Message::text(conv, "").with_create_time(5);

        let page = backend
            .get_message_list(HistoryQuery {
                conversation_id: conv.into(),
                end_time: 0,
                anchor: Some(anchor),
                limit: 2,
            })
            .await
            .unwrap();

        let ids: Vec<_> = page.iter().map(|m| m.client_id.as_str()).collect();
        assert_eq!(ids, vec!["c3", "c4"]);
    }

    #[tokio::test]
    async fn stopping_a_stream_echoes_the_replacement() {
        let (tx, mut rx) = mpsc::channel(4);
        let backend = LoopbackBackend::new("me").with_events(tx);
        let mut reply = Message::text("me|1|bot", "partial").with_client_id("ai1");
        let mut ai = msgsync_messaging::AiConfig::response("bot");
        ai.stream_status = Some(AiStreamStatus::Streaming);
        reply.ai_config = Some(ai);
        backend.seed_history("me|1|bot", vec![reply.clone()]);

        backend
            .stop_ai_stream(&reply, AiStreamStop::Replace("never mind".into()))
            .await
            .unwrap();

        match rx.recv().await {
            Some(BackendEvent::MessagesModified(messages)) => {
                assert_eq!(messages[0].text.as_deref(), Some("never mind"));
                assert_eq!(
                    messages[0].ai_config.as_ref().unwrap().stream_status,
                    Some(AiStreamStatus::Cancelled)
                );
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(backend.stored("me|1|bot")[0].text.as_deref(), Some("never mind"));
    }

    #[tokio::test]
    async fn collections_are_deduplicated_by_unique_id() {
        let backend = LoopbackBackend::new("me");
        let message = Message::text("me|1|bob", "keep").with_client_id("c1");
        let params = AddCollectionParams::for_message(&message, 1).unwrap();

        let first = backend.add_collection(params.clone()).await.unwrap();
        let second = backend.add_collection(params).await.unwrap();
        assert_eq!(first, second);

        let listed = backend.get_collections(CollectionQuery::default()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(backend.remove_collections(&listed).await.unwrap(), 1);
        assert!(backend
            .get_collections(CollectionQuery::default())
            .await
            .unwrap()
            .is_empty());
    }
}
