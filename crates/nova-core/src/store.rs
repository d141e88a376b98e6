//! Durable conversation history.
//!
//! `ConversationStore` is synchronous; async callers wrap calls in
//! `tokio::task::spawn_blocking`. Appends to one session are serialized while
//! distinct sessions proceed concurrently.

use crate::shared::{Message, Session, SessionSummary};
use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Persistence(err.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        StoreError::Persistence(format!("store task failed: {}", err))
    }
}

pub trait ConversationStore: Send + Sync {
    /// Create an empty session and return its id.
    fn create_session(&self) -> Result<String, StoreError>;

    /// Append atomically: the message is either fully visible afterwards or not at all.
    fn append_message(&self, session_id: &str, message: &Message) -> Result<(), StoreError>;

    /// Most recently updated first.
    fn list_sessions(&self) -> Result<Vec<SessionSummary>, StoreError>;

    fn get_session(&self, session_id: &str) -> Result<Session, StoreError>;

    /// The most recently updated session, used to continue a previous conversation.
    fn latest_session(&self) -> Result<Option<Session>, StoreError> {
        match self.list_sessions()?.first() {
            Some(summary) => self.get_session(&summary.session_id).map(Some),
            None => Ok(None),
        }
    }
}

/// In-process store for `conversation.persist = false` and tests.
#[derive(Default)]
pub struct MemoryConversationStore {
    sessions: DashMap<String, Session>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConversationStore for MemoryConversationStore {
    fn create_session(&self) -> Result<String, StoreError> {
        let session = Session::new();
        let id = session.id.clone();
        self.sessions.insert(id.clone(), session);
        Ok(id)
    }

    fn append_message(&self, session_id: &str, message: &Message) -> Result<(), StoreError> {
        // The entry guard holds the shard lock for the whole mutation.
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        session.messages.push(message.clone());
        session.updated_at = Utc::now();
        Ok(())
    }

    fn list_sessions(&self) -> Result<Vec<SessionSummary>, StoreError> {
        let mut rows: Vec<SessionSummary> = self.sessions.iter().map(|s| s.summary()).collect();
        rows.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| b.session_id.cmp(&a.session_id))
        });
        Ok(rows)
    }

    fn get_session(&self, session_id: &str) -> Result<Session, StoreError> {
        self.sessions
            .get(session_id)
            .map(|s| s.clone())
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))
    }
}
