//! The message reconciliation engine.
//!
//! [`MessageSyncEngine`] owns the per-conversation message queues and the pin
//! table. Local actions, backend acknowledgements and backend pushes all
//! funnel through it; observers learn about changes from [`CacheEvent`]s.

mod actions;
mod ai_context;
mod events;
mod mentions;
mod model;
mod reconcile;

pub use actions::{HistoryRequest, SendRequest};
pub use model::{
    recall_id, CachedMessage, ConversationView, EditWindow, Receipt, RecallKind, RecallMarker,
    Sender, UploadState, RECALL_ID_PREFIX,
};

use crate::backend::{BackendError, ImBackend};
use crate::config::EngineConfig;
use crate::store::PinRecord;
use reconcile::CacheState;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("message {client_id} not cached in {conversation_id}")]
    MessageNotFound {
        conversation_id: String,
        client_id: String,
    },
    #[error("conversation {0} not cached")]
    ConversationNotFound(String),
    #[error("voice transcription returned no text")]
    EmptyVoiceText,
    #[error("message {0} is not a transcribable voice message")]
    NotVoiceMessage(String),
    #[error("message {0} has no attachment upload")]
    NoUpload(String),
    #[error("message {0} is not an AI reply")]
    NotAiReply(String),
    #[error("AI reply {0} is still streaming")]
    AiStreamInProgress(String),
    #[error("conversation {0} is not a group conversation")]
    NotGroupConversation(String),
    #[error(transparent)]
    Messaging(#[from] msgsync_messaging::MessagingError),
    #[error("engine has been disposed")]
    Disposed,
}

impl EngineError {
    /// Backend error code, when the backend rejected the request.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Backend(err) => Some(err.code),
            _ => None,
        }
    }
}

/// State changes published to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    MessagesUpserted {
        conversation_id: String,
        client_ids: Vec<String>,
    },
    MessagesRemoved {
        conversation_id: String,
        client_ids: Vec<String>,
    },
    /// A whole conversation, or every conversation when `None`, was emptied.
    MessagesCleared { conversation_id: Option<String> },
    PinsChanged { conversation_id: String },
    ReceiptTimeChanged {
        conversation_id: String,
        timestamp: i64,
    },
    MentionsChanged {
        conversation_id: String,
        mention_ids: Vec<String>,
    },
    ConversationChanged { conversation_id: String },
}

struct ListenerHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct EngineInner {
    config: EngineConfig,
    backend: Arc<dyn ImBackend>,
    state: Mutex<CacheState>,
    event_tx: broadcast::Sender<CacheEvent>,
    listener: Mutex<Option<ListenerHandle>>,
}

/// Shared handle to the cache. Clones refer to the same engine.
#[derive(Clone)]
pub struct MessageSyncEngine {
    inner: Arc<EngineInner>,
}

impl MessageSyncEngine {
    pub fn new(
        config: EngineConfig,
        backend: Arc<dyn ImBackend>,
        account_id: impl Into<String>,
    ) -> Self {
        let (event_tx, _rx) = broadcast::channel(config.event_capacity.max(1));
        let state = CacheState::new(&config, account_id.into());
        Self {
            inner: Arc::new(EngineInner {
                config,
                backend,
                state: Mutex::new(state),
                event_tx,
                listener: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.event_tx.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn account_id(&self) -> String {
        self.lock().session.account_id.clone()
    }

    /// Replace the set of accounts treated as AI personas.
    pub fn set_ai_accounts<I>(&self, accounts: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.lock().session.ai_accounts = accounts.into_iter().collect();
    }

    /// Mark the conversation the user is looking at. Its queue is bounded to
    /// the history limit from now on.
    pub fn select_conversation(&self, conversation_id: Option<&str>) {
        let mut state = self.lock();
        state.session.selected = conversation_id.map(str::to_string);
        if let Some(conversation_id) = conversation_id {
            state.reset_limit_state(Some(conversation_id));
        }
        debug!(?conversation_id, "conversation selected");
    }

    pub fn selected_conversation(&self) -> Option<String> {
        self.lock().session.selected.clone()
    }

    /// Re-apply the history limit to every conversation, e.g. after a
    /// jump-to-message load completes.
    pub fn reset_limit_state(&self) {
        self.lock().reset_limit_state(None);
    }

    /// Cached messages of a conversation, oldest first.
    pub fn messages(&self, conversation_id: &str) -> Vec<CachedMessage> {
        self.lock()
            .messages
            .get(conversation_id)
            .map(<[CachedMessage]>::to_vec)
            .unwrap_or_default()
    }

    pub fn message(&self, conversation_id: &str, client_id: &str) -> Option<CachedMessage> {
        self.lock().find(conversation_id, client_id).cloned()
    }

    /// Every cached message across conversations, in no particular order.
    pub fn all_messages(&self) -> Vec<CachedMessage> {
        self.lock().messages.values().cloned().collect()
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<ConversationView> {
        self.lock().conversations.get(conversation_id).cloned()
    }

    /// Pin records currently cached for a conversation, without refreshing
    /// its position in the pin table.
    pub fn cached_pins(&self, conversation_id: &str) -> Option<Vec<PinRecord>> {
        self.lock()
            .pins
            .peek(conversation_id)
            .map(|pins| pins.values().cloned().collect())
    }

    /// Merge messages into a conversation's cache. Ignored once disposed.
    pub fn add_messages(&self, conversation_id: &str, messages: Vec<CachedMessage>) {
        let mut state = self.lock();
        if state.disposed {
            debug!(conversation_id, "engine disposed, dropping messages");
            return;
        }
        let client_ids = state.upsert(conversation_id, messages);
        self.notify_upserted(conversation_id, client_ids);
    }

    /// Remove cached messages: everything, one conversation, or specific ids.
    /// Ignored once disposed.
    pub fn remove_messages(&self, conversation_id: Option<&str>, client_ids: &[String]) {
        let removed = {
            let mut state = self.lock();
            if state.disposed {
                return;
            }
            state.remove(conversation_id, client_ids)
        };
        self.notify_removed(conversation_id, client_ids, removed);
    }

    /// Drop all cached state and cancel pending timers, e.g. on logout.
    pub fn reset(&self) {
        self.lock().clear();
        self.emit(CacheEvent::MessagesCleared {
            conversation_id: None,
        });
        info!("message cache reset");
    }

    /// Reset and stop the push listener. Later actions fail with
    /// [`EngineError::Disposed`].
    pub fn dispose(&self) {
        self.reset();
        self.lock().disposed = true;
        let listener = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener) = listener {
            let _ = listener.shutdown.send(());
            listener.task.abort();
        }
        info!("message sync engine disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.lock().disposed
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_active(&self) -> EngineResult<()> {
        if self.is_disposed() {
            return Err(EngineError::Disposed);
        }
        Ok(())
    }

    fn backend(&self) -> &dyn ImBackend {
        self.inner.backend.as_ref()
    }

    fn emit(&self, event: CacheEvent) {
        let _ = self.inner.event_tx.send(event);
    }

    fn notify_upserted(&self, conversation_id: &str, client_ids: Vec<String>) {
        if client_ids.is_empty() {
            return;
        }
        self.emit(CacheEvent::MessagesUpserted {
            conversation_id: conversation_id.to_string(),
            client_ids,
        });
    }

    fn notify_removed(
        &self,
        conversation_id: Option<&str>,
        client_ids: &[String],
        removed: Vec<CachedMessage>,
    ) {
        match conversation_id {
            Some(conversation_id) if !client_ids.is_empty() => {
                if removed.is_empty() {
                    return;
                }
                self.emit(CacheEvent::MessagesRemoved {
                    conversation_id: conversation_id.to_string(),
                    client_ids: removed.iter().map(|m| m.client_id().to_string()).collect(),
                });
            }
            conversation_id => self.emit(CacheEvent::MessagesCleared {
                conversation_id: conversation_id.map(str::to_string),
            }),
        }
    }

    fn notify_mentions(&self, state: &CacheState, conversation_ids: Vec<String>) {
        for conversation_id in conversation_ids {
            let mention_ids = state
                .conversations
                .get(&conversation_id)
                .map(|view| view.mention_ids.clone())
                .unwrap_or_default();
            self.emit(CacheEvent::MentionsChanged {
                conversation_id,
                mention_ids,
            });
        }
    }
}
