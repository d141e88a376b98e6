//! Dialogue memory for one session.
//!
//! The stored history keeps everything; only the outgoing request is windowed to the
//! newest `max_history` non-system messages.

use crate::config::Settings;
use crate::shared::{Message, Role, Session};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DialogueError {
    #[error("dialogue backend timed out")]
    Timeout,

    #[error("dialogue backend rate limited: {0}")]
    RateLimited(String),

    #[error("malformed dialogue reply: {0}")]
    Malformed(String),

    #[error("dialogue backend error: {0}")]
    Backend(String),
}

impl DialogueError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, DialogueError::RateLimited(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionOptions {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            max_tokens: 500,
            temperature: 0.7,
        }
    }
}

/// Produces the next assistant reply for an already-assembled request.
#[async_trait]
pub trait DialogueBackend: Send + Sync {
    async fn complete(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<String, DialogueError>;
}

#[derive(Clone)]
pub struct DialogueSession {
    session_id: String,
    system_prompt: String,
    history: Vec<Message>,
    max_history: usize,
    options: CompletionOptions,
    backend: Arc<dyn DialogueBackend>,
}

impl std::fmt::Debug for DialogueSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialogueSession")
            .field("session_id", &self.session_id)
            .field("messages", &self.history.len())
            .field("max_history", &self.max_history)
            .finish()
    }
}

impl DialogueSession {
    pub fn new(
        session_id: impl Into<String>,
        system_prompt: impl Into<String>,
        max_history: usize,
        options: CompletionOptions,
        backend: Arc<dyn DialogueBackend>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            system_prompt: system_prompt.into(),
            history: Vec::new(),
            max_history: max_history.max(1),
            options,
            backend,
        }
    }

    /// Continue a stored conversation.
    pub fn resume(
        session: &Session,
        system_prompt: impl Into<String>,
        max_history: usize,
        options: CompletionOptions,
        backend: Arc<dyn DialogueBackend>,
    ) -> Self {
        let mut this = Self::new(session.id.clone(), system_prompt, max_history, options, backend);
        this.history = session.messages.clone();
        this
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn options(&self) -> &CompletionOptions {
        &self.options
    }

    pub fn append_user(&mut self, text: impl Into<String>) {
        self.history.push(Message::user(text));
    }

    pub fn append_assistant(&mut self, text: impl Into<String>) {
        self.history.push(Message::assistant(text));
    }

    /// Append an already-built message (keeps the timestamp that was persisted).
    pub fn append(&mut self, message: Message) {
        self.history.push(message);
    }

    /// Take the prompt, model and window bound from the current runtime settings.
    pub fn apply_settings(&mut self, settings: &Settings) {
        self.system_prompt = settings.prompt.clone();
        self.options.model = settings.model.clone();
        self.max_history = settings.max_history.max(1);
    }

    /// Request body for the next reply: system prompt, any stored system messages,
    /// then the newest `max_history` user/assistant messages. `pending` is user text not
    /// yet in the history; it is sent last. With `None` the history is sent as is.
    pub fn outgoing_request(&self, pending: Option<&str>) -> Vec<Message> {
        let mut turns: Vec<Message> = self
            .history
            .iter()
            .filter(|m| m.role != Role::System)
            .cloned()
            .collect();
        if let Some(text) = pending {
            turns.push(Message::user(text));
        }
        let skip = turns.len().saturating_sub(self.max_history);

        let mut request = Vec::with_capacity(self.max_history + 1);
        if !self.system_prompt.trim().is_empty() {
            request.push(Message::system(self.system_prompt.clone()));
        }
        request.extend(self.history.iter().filter(|m| m.role == Role::System).cloned());
        request.extend(turns.into_iter().skip(skip));
        request
    }

    /// Reply to `text`, which the caller has not appended to the history.
    pub async fn next_reply(&self, text: &str) -> Result<String, DialogueError> {
        self.complete(self.outgoing_request(Some(text))).await
    }

    /// Reply to the history as it stands; the caller has already appended the user message.
    pub async fn reply_to_history(&self) -> Result<String, DialogueError> {
        match self.history.iter().rev().find(|m| m.role != Role::System) {
            Some(m) if m.role == Role::User => self.complete(self.outgoing_request(None)).await,
            _ => Err(DialogueError::Backend(
                "no pending user message to answer".to_string(),
            )),
        }
    }

    async fn complete(&self, request: Vec<Message>) -> Result<String, DialogueError> {
        let reply = self.backend.complete(&request, &self.options).await?;
        let reply = reply.trim();
        if reply.is_empty() {
            return Err(DialogueError::Malformed("empty reply".to_string()));
        }
        Ok(reply.to_string())
    }
}
