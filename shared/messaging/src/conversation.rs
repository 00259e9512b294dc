//! Conversation id helpers.
//!
//! Conversation ids have the form `<owner>|<type code>|<target>`, where the
//! target is the peer account for direct chats or the team id for groups.

use crate::{ConversationType, MessagingError, Result};

pub fn conversation_id(owner: &str, conversation_type: ConversationType, target: &str) -> String {
    format!("{owner}|{}|{target}", conversation_type.code())
}

pub fn parse_conversation_type(conversation_id: &str) -> Result<ConversationType> {
    let (_, code, _) = split(conversation_id)?;
    code.parse::<u8>()
        .ok()
        .and_then(ConversationType::from_code)
        .ok_or_else(|| MessagingError::InvalidConversationId(conversation_id.to_string()))
}

pub fn parse_target_id(conversation_id: &str) -> Result<&str> {
    let (_, _, target) = split(conversation_id)?;
    Ok(target)
}

fn split(conversation_id: &str) -> Result<(&str, &str, &str)> {
    let mut parts = conversation_id.splitn(3, '|');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(code), Some(target)) if !target.is_empty() => Ok((owner, code, target)),
        _ => Err(MessagingError::InvalidConversationId(
            conversation_id.to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_and_parses() {
        let id = conversation_id("me", ConversationType::SuperTeam, "t-1");
        assert_eq!(id, "me|3|t-1");
        assert_eq!(parse_conversation_type(&id).unwrap(), ConversationType::SuperTeam);
        assert_eq!(parse_target_id(&id).unwrap(), "t-1");
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(parse_target_id("no-separators").is_err());
        assert!(parse_conversation_type("me|9|x").is_err());
        assert!(parse_target_id("me|1|").is_err());
    }
}
