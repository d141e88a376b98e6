//! Shared types used across the Nova crates: conversation records, turn states
//! and the dashboard event envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// -----------------------------------------------------------------------------
// Conversation records
// -----------------------------------------------------------------------------

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable entry of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

/// A persisted conversation. `messages` is append-only and kept in conversational order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub messages: Vec<Message>,
}

impl Session {
    /// Fresh, empty session with a generated id.
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: new_session_id(),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            message_count: self.messages.len(),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Row returned by `ConversationStore::list_sessions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
}

/// Session ids look like `20260114_093012_1a2b3c4d`: sortable creation time plus a random suffix.
pub fn new_session_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", Utc::now().format("%Y%m%d_%H%M%S"), &suffix[..8])
}

// -----------------------------------------------------------------------------
// Turn state machine
// -----------------------------------------------------------------------------

/// The single live state of a turn orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnState {
    Idle,
    Activating,
    Listening,
    Transcribing,
    Thinking,
    Speaking,
    Error,
}

impl TurnState {
    pub const ALL: [TurnState; 7] = [
        TurnState::Idle,
        TurnState::Activating,
        TurnState::Listening,
        TurnState::Transcribing,
        TurnState::Thinking,
        TurnState::Speaking,
        TurnState::Error,
    ];

    /// Legal edges of the turn graph. Any non-idle state may be cut short to `Idle`
    /// (stop) and any state except `Error` itself may fail into `Error`.
    pub fn can_transition_to(self, next: TurnState) -> bool {
        use TurnState::*;
        match (self, next) {
            (Idle, Activating)
            | (Activating, Listening)
            | (Listening, Transcribing)
            | (Transcribing, Thinking)
            | (Thinking, Speaking) => true,
            (Error, Error) | (Idle, Idle) => false,
            (_, Error) | (_, Idle) => true,
            _ => false,
        }
    }

    /// True while the microphone belongs to the turn.
    pub fn is_listening(self) -> bool {
        matches!(self, TurnState::Activating | TurnState::Listening)
    }

    pub fn is_active(self) -> bool {
        self != TurnState::Idle
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TurnState::Idle => "idle",
            TurnState::Activating => "activating",
            TurnState::Listening => "listening",
            TurnState::Transcribing => "transcribing",
            TurnState::Thinking => "thinking",
            TurnState::Speaking => "speaking",
            TurnState::Error => "error",
        }
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a turn ended in `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    CaptureError,
    RecognitionError,
    DialogueError,
    SynthesisError,
    PersistenceError,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::CaptureError => "CaptureError",
            FailureKind::RecognitionError => "RecognitionError",
            FailureKind::DialogueError => "DialogueError",
            FailureKind::SynthesisError => "SynthesisError",
            FailureKind::PersistenceError => "PersistenceError",
        };
        f.write_str(s)
    }
}

// -----------------------------------------------------------------------------
// Dashboard events
// -----------------------------------------------------------------------------

/// Event pushed to dashboard observers. `sequence` increases by one per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardEvent {
    pub session_id: String,
    pub sequence: u64,
    #[serde(flatten)]
    pub payload: EventPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Status {
        state: TurnState,
        listening: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<FailureKind>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Message {
        role: Role,
        content: String,
    },
}

impl EventPayload {
    pub fn status(state: TurnState) -> Self {
        EventPayload::Status {
            state,
            listening: state.is_listening(),
            error: None,
            detail: None,
        }
    }

    pub fn failure(kind: FailureKind, detail: impl Into<String>) -> Self {
        EventPayload::Status {
            state: TurnState::Error,
            listening: false,
            error: Some(kind),
            detail: Some(detail.into()),
        }
    }

    pub fn message(message: &Message) -> Self {
        EventPayload::Message {
            role: message.role,
            content: message.content.clone(),
        }
    }
}

impl DashboardEvent {
    /// `"status"` or `"message"`.
    pub fn kind(&self) -> &'static str {
        match self.payload {
            EventPayload::Status { .. } => "status",
            EventPayload::Message { .. } => "message",
        }
    }

    pub fn state(&self) -> Option<TurnState> {
        match self.payload {
            EventPayload::Status { state, .. } => Some(state),
            EventPayload::Message { .. } => None,
        }
    }
}
