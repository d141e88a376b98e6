//! nova-core: shared types, configuration, dialogue memory, conversation store and
//! dashboard event fan-out for the Nova voice assistant.

mod chat_backend;
mod config;
mod dialogue;
mod events;
mod shared;
mod sqlite_store;
mod store;

pub use chat_backend::{ChatCompletionsBackend, API_KEY_VARS};
pub use config::{
    api_key_from_env, AssistantConfig, AudioSettings, ConfigError, ConversationConfig,
    DialogueConfig, LlmConfig, LoggingConfig, NovaConfig, Settings, SettingsUpdate,
    SharedSettings, TtsConfig, WebConfig, WhisperConfig, MAX_HISTORY_LIMIT, WHISPER_MODEL_SIZES,
};
pub use dialogue::{CompletionOptions, DialogueBackend, DialogueError, DialogueSession};
pub use events::{EventBroadcaster, EventSubscription};
pub use shared::{
    new_session_id, DashboardEvent, EventPayload, FailureKind, Message, Role, Session,
    SessionSummary, TurnState,
};
pub use sqlite_store::SqliteConversationStore;
pub use store::{ConversationStore, MemoryConversationStore, StoreError};

use std::sync::Arc;

/// Store selected by `conversation.persist`: SQLite under `persist_path`, or in-memory.
pub fn open_store(config: &ConversationConfig) -> Result<Arc<dyn ConversationStore>, StoreError> {
    if config.persist {
        Ok(Arc::new(SqliteConversationStore::new(config.database_path())?))
    } else {
        Ok(Arc::new(MemoryConversationStore::new()))
    }
}
