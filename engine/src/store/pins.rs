//! Least-recently-used cache of pinned messages per conversation.

use msgsync_messaging::{Message, MessagePin, MessageRefer, PinState};
use std::collections::{HashMap, VecDeque};

/// Cached pin state of one message.
#[derive(Debug, Clone, PartialEq)]
pub struct PinRecord {
    pub message_refer: MessageRefer,
    pub pin_state: PinState,
    pub operator_id: String,
    pub server_extension: Option<String>,
    pub create_time: i64,
    pub update_time: i64,
    /// Full message body, once completed from the backend.
    pub message: Option<Message>,
}

impl PinRecord {
    pub fn from_pin(pin: MessagePin, pin_state: PinState) -> Self {
        Self {
            message_refer: pin.message_refer,
            pin_state,
            operator_id: pin.operator_id,
            server_extension: pin.server_extension,
            create_time: pin.create_time,
            update_time: pin.update_time,
            message: None,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.message_refer.conversation_id
    }

    pub fn client_id(&self) -> &str {
        &self.message_refer.client_id
    }
}

/// Pin records keyed by message client id.
pub type PinMap = HashMap<String, PinRecord>;

/// Pin records for at most `limit` conversations.
///
/// Every `set`, `get` hit, and `delete` hit moves the conversation to the back
/// of the order; overflow evicts the conversation at the front.
#[derive(Debug, Clone)]
pub struct PinTable {
    maps: HashMap<String, PinMap>,
    order: VecDeque<String>,
    limit: usize,
}

impl PinTable {
    pub fn new(limit: usize) -> Self {
        Self {
            maps: HashMap::new(),
            order: VecDeque::new(),
            limit,
        }
    }

    /// Upsert records for a conversation. Records with pin state 0 are removed
    /// rather than stored. Returns the evicted conversation, if any.
    pub fn set(&mut self, conversation_id: &str, records: Vec<PinRecord>) -> Option<String> {
        let map = self.maps.entry(conversation_id.to_string()).or_default();
        for record in records {
            let key = record.client_id().to_string();
            if record.pin_state.is_pinned() {
                map.insert(key, record);
            } else {
                map.remove(&key);
            }
        }
        self.promote(conversation_id);

        if self.order.len() > self.limit {
            let evicted = self.order.pop_front()?;
            self.maps.remove(&evicted);
            return Some(evicted);
        }
        None
    }

    /// The conversation's pin map, promoting it when tracked.
    pub fn get(&mut self, conversation_id: &str) -> Option<&PinMap> {
        if !self.maps.contains_key(conversation_id) {
            return None;
        }
        self.promote(conversation_id);
        self.maps.get(conversation_id)
    }

    /// Read without touching the eviction order.
    pub fn peek(&self, conversation_id: &str) -> Option<&PinMap> {
        self.maps.get(conversation_id)
    }

    /// Drop specific records while keeping the conversation tracked.
    pub fn delete(&mut self, conversation_id: &str, client_ids: &[String]) {
        let Some(map) = self.maps.get_mut(conversation_id) else {
            return;
        };
        for client_id in client_ids {
            map.remove(client_id);
        }
        self.promote(conversation_id);
    }

    pub fn contains(&self, conversation_id: &str) -> bool {
        self.maps.contains_key(conversation_id)
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    pub fn clear(&mut self) {
        self.maps.clear();
        self.order.clear();
    }

    fn promote(&mut self, conversation_id: &str) {
        if let Some(pos) = self.order.iter().position(|id| id == conversation_id) {
            self.order.remove(pos);
        }
        self.order.push_back(conversation_id.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(conversation_id: &str, client_id: &str, pin_state: PinState) -> PinRecord {
        PinRecord::from_pin(
            MessagePin {
                message_refer: MessageRefer {
                    conversation_id: conversation_id.into(),
                    client_id: client_id.into(),
                    ..Default::default()
                },
                operator_id: "op".into(),
                ..Default::default()
            },
            pin_state,
        )
    }

    #[test]
    fn evicts_oldest_conversation_on_overflow() {
        let mut table = PinTable::new(2);
        table.set("A", vec![record("A", "a1", PinState::Pinned)]);
        table.set("B", vec![record("B", "b1", PinState::Pinned)]);
        let evicted = table.set("C", vec![record("C", "c1", PinState::Pinned)]);

        assert_eq!(evicted.as_deref(), Some("A"));
        assert!(table.get("A").is_none());
        assert!(table.contains("B"));
        assert!(table.contains("C"));
    }

    #[test]
    fn get_protects_from_eviction() {
        let mut table = PinTable::new(2);
        table.set("A", vec![record("A", "a1", PinState::Pinned)]);
        table.set("B", vec![record("B", "b1", PinState::Pinned)]);
        assert!(table.get("A").is_some());

        let evicted = table.set("C", vec![]);
        assert_eq!(evicted.as_deref(), Some("B"));
        assert!(table.contains("A"));
    }

    #[test]
    fn zero_state_records_are_removed_not_stored() {
        let mut table = PinTable::new(5);
        table.set(
            "A",
            vec![
                record("A", "a1", PinState::Pinned),
                record("A", "a2", PinState::Updated),
            ],
        );
        table.set("A", vec![record("A", "a1", PinState::NotPinned)]);

        let map = table.peek("A").unwrap();
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("a2"));
    }

    #[test]
    fn delete_keeps_conversation_and_promotes_it() {
        let mut table = PinTable::new(2);
        table.set("A", vec![record("A", "a1", PinState::Pinned)]);
        table.set("B", vec![record("B", "b1", PinState::Pinned)]);
        table.delete("A", &["a1".to_string()]);

        assert!(table.peek("A").unwrap().is_empty());
        let evicted = table.set("C", vec![]);
        assert_eq!(evicted.as_deref(), Some("B"));
    }

    #[test]
    fn get_on_untracked_conversation_is_none() {
        let mut table = PinTable::new(1);
        assert!(table.get("nope").is_none());
        table.delete("nope", &["x".to_string()]);
        assert!(table.is_empty());
        table.set("A", vec![]);
        table.clear();
        assert_eq!(table.len(), 0);
    }
}
