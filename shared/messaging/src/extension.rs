//! Server extension payloads.
//!
//! Mention and reply metadata travel inside a free-form JSON object attached to
//! each message. Unknown keys are preserved so a parsed extension can be written
//! back without losing data set by other clients.

use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MentionSegment {
    pub start: usize,
    pub end: usize,
    #[serde(default)]
    pub broken: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mention {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub segments: Vec<MentionSegment>,
}

/// Reply pointer used by the extension-based reply mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyReference {
    #[serde(rename = "idClient")]
    pub client_id: String,
    #[serde(rename = "idServer", default)]
    pub server_id: Option<String>,
    #[serde(rename = "scene")]
    pub conversation_type: u8,
    #[serde(rename = "from")]
    pub sender_id: String,
    #[serde(rename = "receiverId")]
    pub receiver_id: String,
    #[serde(rename = "to")]
    pub conversation_id: String,
    pub time: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerExtension {
    /// Mentioned account id to mention details.
    #[serde(rename = "yxAitMsg", default, skip_serializing_if = "Option::is_none")]
    pub mentions: Option<BTreeMap<String, Mention>>,
    #[serde(rename = "yxReplyMsg", default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<ReplyReference>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ServerExtension {
    /// Parse a raw extension. Blank input yields an empty extension.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(raw)?)
    }

    pub fn is_empty(&self) -> bool {
        self.mentions.as_ref().map_or(true, BTreeMap::is_empty)
            && self.reply.is_none()
            && self.extra.is_empty()
    }

    /// Serialized form, or `None` when nothing is set.
    pub fn to_json(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        serde_json::to_string(self).ok()
    }

    /// True when `account` or the everyone sentinel is mentioned.
    pub fn mentions_account(&self, account: &str, everyone: &str) -> bool {
        self.mentions
            .as_ref()
            .is_some_and(|m| m.contains_key(account) || m.contains_key(everyone))
    }

    /// The mentioned account whose first segment appears earliest in the text,
    /// restricted to accounts accepted by `filter`.
    pub fn earliest_mention<F>(&self, mut filter: F) -> Option<&str>
    where
        F: FnMut(&str) -> bool,
    {
        let mut earliest: Option<(usize, &str)> = None;
        for (account, mention) in self.mentions.iter().flatten() {
            if !filter(account) {
                continue;
            }
            for segment in &mention.segments {
                if earliest.map_or(true, |(start, _)| segment.start < start) {
                    earliest = Some((segment.start, account.as_str()));
                }
            }
        }
        earliest.map(|(_, account)| account)
    }

    /// Account ids to force-push to, or `None` when everyone is mentioned.
    pub fn force_push_accounts(&self, everyone: &str) -> Option<Vec<String>> {
        let mentions = self.mentions.as_ref()?;
        if mentions.contains_key(everyone) {
            return None;
        }
        Some(mentions.keys().cloned().collect())
    }

    /// Drop metadata that must not follow a message when it is forwarded.
    pub fn strip_forward_metadata(&mut self) {
        self.mentions = None;
        self.reply = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &str = r#"{
        "yxAitMsg": {
            "bob": {"text": "@bob", "segments": [{"start": 9, "end": 12}]},
            "ai-1": {"text": "@helper", "segments": [{"start": 0, "end": 6}]}
        },
        "custom": 3
    }"#;

    #[test]
    fn parses_mentions_and_keeps_unknown_keys() {
        let ext = ServerExtension::parse(RAW).unwrap();
        assert!(ext.mentions_account("bob", "ait_all"));
        assert!(!ext.mentions_account("carol", "ait_all"));
        assert_eq!(ext.extra.get("custom"), Some(&Value::from(3)));
    }

    #[test]
    fn everyone_sentinel_matches_any_account() {
        let ext = ServerExtension::parse(r#"{"yxAitMsg":{"ait_all":{"text":"@all","segments":[]}}}"#)
            .unwrap();
        assert!(ext.mentions_account("anyone", "ait_all"));
        assert_eq!(ext.force_push_accounts("ait_all"), None);
    }

    #[test]
    fn earliest_mention_respects_filter() {
        let ext = ServerExtension::parse(RAW).unwrap();
        assert_eq!(ext.earliest_mention(|_| true), Some("ai-1"));
        assert_eq!(ext.earliest_mention(|a| a == "bob"), Some("bob"));
        assert_eq!(ext.earliest_mention(|_| false), None);
    }

    #[test]
    fn malformed_and_blank_input() {
        assert!(ServerExtension::parse("{not json").is_err());
        assert!(ServerExtension::parse("").unwrap().is_empty());
    }

    #[test]
    fn stripping_forward_metadata_keeps_custom_keys() {
        let mut ext = ServerExtension::parse(RAW).unwrap();
        ext.strip_forward_metadata();
        let json = ext.to_json().unwrap();
        assert!(!json.contains("yxAitMsg"));
        assert!(json.contains("custom"));
    }
}
