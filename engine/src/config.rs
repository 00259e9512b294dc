use std::env;
use std::time::Duration;

/// Error code the backend uses when the user cancelled an in-flight send.
pub const CANCELLED_ERROR_CODE: i32 = 191002;

/// Runtime configuration for the sync engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Messages kept per conversation while it is the selected one.
    pub history_limit: usize,
    /// Conversations whose pin lists are kept warm.
    pub pin_conversation_limit: usize,
    /// How long a self-recalled text stays re-editable.
    pub recall_edit_window: Duration,
    /// Recent messages considered when building an AI context window.
    pub ai_context_limit: usize,
    /// Mention key meaning "everyone in the group".
    pub mention_all_account: String,
    pub cancelled_error_code: i32,
    /// Fetch read counts for own group messages after loading history.
    pub team_receipt_visible: bool,
    /// Embed reply references in the server extension instead of using the
    /// backend's thread reply request.
    pub reply_by_extension: bool,
    pub ai_stream: bool,
    /// Upper bound on messages per receipt request.
    pub receipt_batch_size: usize,
    /// Capacity of the state-change broadcast channel.
    pub event_capacity: usize,
}

impl EngineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            history_limit: parse_var("MSGSYNC_HISTORY_LIMIT")?.unwrap_or(defaults.history_limit),
            pin_conversation_limit: parse_var("MSGSYNC_PIN_CONVERSATION_LIMIT")?
                .unwrap_or(defaults.pin_conversation_limit),
            recall_edit_window: parse_var("MSGSYNC_RECALL_EDIT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.recall_edit_window),
            ai_context_limit: parse_var("MSGSYNC_AI_CONTEXT_LIMIT")?
                .unwrap_or(defaults.ai_context_limit),
            team_receipt_visible: parse_var("MSGSYNC_TEAM_RECEIPT_VISIBLE")?
                .unwrap_or(defaults.team_receipt_visible),
            ai_stream: parse_var("MSGSYNC_AI_STREAM")?.unwrap_or(defaults.ai_stream),
            ..defaults
        })
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn with_pin_conversation_limit(mut self, limit: usize) -> Self {
        self.pin_conversation_limit = limit;
        self
    }

    pub fn with_recall_edit_window(mut self, window: Duration) -> Self {
        self.recall_edit_window = window;
        self
    }

    pub fn with_ai_context_limit(mut self, limit: usize) -> Self {
        self.ai_context_limit = limit;
        self
    }

    pub fn with_team_receipt_visible(mut self, visible: bool) -> Self {
        self.team_receipt_visible = visible;
        self
    }

    pub fn with_reply_by_extension(mut self, enabled: bool) -> Self {
        self.reply_by_extension = enabled;
        self
    }

    pub fn with_ai_stream(mut self, enabled: bool) -> Self {
        self.ai_stream = enabled;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_limit: 15,
            pin_conversation_limit: 10,
            recall_edit_window: Duration::from_secs(2 * 60),
            ai_context_limit: 30,
            mention_all_account: "ait_all".to_string(),
            cancelled_error_code: CANCELLED_ERROR_CODE,
            team_receipt_visible: true,
            reply_by_extension: false,
            ai_stream: false,
            receipt_batch_size: 50,
            event_capacity: 256,
        }
    }
}

fn parse_var<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid value for {key}: {e}")),
        Err(_) => Ok(None),
    }
}
