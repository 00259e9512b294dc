//! Saved-message collections ("favourites").

use crate::{Message, MessagingError, Result};
use serde::{Deserialize, Serialize};

/// A collection entry as stored by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub collection_id: String,
    pub collection_type: u32,
    /// JSON document. Message collections keep the message under `message`.
    pub collection_data: String,
    pub unique_id: Option<String>,
    pub server_extension: Option<String>,
    pub create_time: i64,
    pub update_time: i64,
}

#[derive(Serialize, Deserialize)]
struct MessageEnvelope {
    message: Message,
}

impl Collection {
    /// The collected message, when this entry holds one.
    pub fn message(&self) -> Result<Message> {
        serde_json::from_str::<MessageEnvelope>(&self.collection_data)
            .map(|envelope| envelope.message)
            .map_err(MessagingError::InvalidCollection)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddCollectionParams {
    pub collection_type: u32,
    pub collection_data: String,
    /// Deduplication key; a second add with the same key is a no-op.
    pub unique_id: Option<String>,
    pub server_extension: Option<String>,
}

impl AddCollectionParams {
    /// Collect `message`, keyed by its client id.
    pub fn for_message(message: &Message, collection_type: u32) -> Result<Self> {
        let envelope = MessageEnvelope {
            message: message.clone(),
        };
        Ok(Self {
            collection_type,
            collection_data: serde_json::to_string(&envelope)
                .map_err(MessagingError::InvalidCollection)?,
            unique_id: Some(message.client_id.clone()),
            server_extension: None,
        })
    }
}

/// Page of collections to list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionQuery {
    pub begin_time: i64,
    /// `0` means "now".
    pub end_time: i64,
    /// Last entry of the previous page.
    pub anchor: Option<Collection>,
    pub limit: usize,
    /// `None` lists every type.
    pub collection_type: Option<u32>,
}

impl Default for CollectionQuery {
    fn default() -> Self {
        Self {
            begin_time: 0,
            end_time: 0,
            anchor: None,
            limit: 100,
            collection_type: None,
        }
    }
}

impl CollectionQuery {
    pub fn of_type(collection_type: u32) -> Self {
        Self {
            collection_type: Some(collection_type),
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn matches(&self, collection: &Collection) -> bool {
        let before_end = self.end_time == 0 || collection.create_time <= self.end_time;
        let type_matches = self
            .collection_type
            .map_or(true, |t| t == collection.collection_type);
        let past_anchor = self
            .anchor
            .as_ref()
            .map_or(true, |anchor| collection.create_time < anchor.create_time);
        collection.create_time >= self.begin_time && before_end && type_matches && past_anchor
    }
}
