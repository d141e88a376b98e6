//! Dashboard HTTP API.

use crate::live;
use axum::{
    extract::{Path, Query, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use nova_core::{ConversationStore, EventBroadcaster, SettingsUpdate, SharedSettings, StoreError};
use nova_voice::{filter_voices, SpeechSynthesizer, TurnOrchestrator};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

const PREVIEW_VOICE: &str = "en-US-AriaNeural";
const PREVIEW_TEXT: &str = "Hello, this is a voice preview.";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: TurnOrchestrator,
    pub store: Arc<dyn ConversationStore>,
    pub events: Arc<EventBroadcaster>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub settings: SharedSettings,
    /// Where accepted settings are written; `None` keeps them in memory only.
    pub settings_path: Option<PathBuf>,
}

pub fn build_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/api/conversations", get(list_conversations))
        .route("/api/conversations/:id", get(get_conversation))
        .route("/api/voices", get(list_voices))
        .route("/api/voices/preview", post(preview_voice))
        .route("/api/config", get(get_config).post(update_config))
        .route("/api/status", get(status))
        .route("/ws", get(live::ws_handler))
        .layer(cors)
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn store_error(err: StoreError) -> Response {
    match err {
        StoreError::NotFound(_) => error_response(StatusCode::NOT_FOUND, "Session not found"),
        StoreError::Persistence(e) => {
            warn!(target: "nova::api", "store failure: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

async fn list_conversations(State(state): State<AppState>) -> Response {
    let store = Arc::clone(&state.store);
    match tokio::task::spawn_blocking(move || store.list_sessions()).await {
        Ok(Ok(rows)) => Json(rows).into_response(),
        Ok(Err(e)) => store_error(e),
        Err(e) => store_error(e.into()),
    }
}

async fn get_conversation(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let store = Arc::clone(&state.store);
    match tokio::task::spawn_blocking(move || store.get_session(&id)).await {
        Ok(Ok(session)) => Json(json!({
            "session_id": session.id,
            "created_at": session.created_at,
            "messages": session.messages,
        }))
        .into_response(),
        Ok(Err(e)) => store_error(e),
        Err(e) => store_error(e.into()),
    }
}

#[derive(Debug, Deserialize)]
struct VoiceQuery {
    language: Option<String>,
}

async fn list_voices(State(state): State<AppState>, Query(q): Query<VoiceQuery>) -> Response {
    match state.synthesizer.list_voices().await {
        Ok(voices) => Json(filter_voices(voices, q.language.as_deref())).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Debug, Default, Deserialize)]
struct PreviewRequest {
    voice: Option<String>,
    text: Option<String>,
}

async fn preview_voice(
    State(state): State<AppState>,
    body: Option<Json<PreviewRequest>>,
) -> Response {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let voice = req
        .voice
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| PREVIEW_VOICE.to_string());
    let text = req
        .text
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| PREVIEW_TEXT.to_string());

    match state.synthesizer.synthesize(&text, &voice).await {
        Ok(audio) => Json(json!({ "audio": BASE64.encode(audio) })).into_response(),
        Err(e) => {
            warn!(target: "nova::api", "voice preview failed for {}: {}", voice, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn get_config(State(state): State<AppState>) -> Response {
    let settings = state.settings.read().await.clone();
    Json(settings).into_response()
}

async fn update_config(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let update = match SettingsUpdate::from_json(body) {
        Ok(u) => u,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let settings = {
        let mut current = state.settings.write().await;
        if let Err(e) = current.apply(update) {
            return error_response(StatusCode::BAD_REQUEST, e.to_string());
        }
        current.clone()
    };
    info!(target: "nova::api", "settings updated (model: {}, wake word: {:?})", settings.model, settings.wake_word);

    if let Some(path) = &state.settings_path {
        if let Err(e) = settings.save_to_path(path) {
            warn!(target: "nova::api", "could not save settings to {}: {}", path.display(), e);
        }
    }

    Json(json!({ "status": "ok", "settings": settings })).into_response()
}

async fn status(State(state): State<AppState>) -> Response {
    let settings = state.settings.read().await.clone();
    let session_id = state.orchestrator.session_id().await;
    Json(json!({
        "status": "running",
        "name": settings.name,
        "wake_word": settings.wake_word,
        "model": settings.model,
        "state": state.orchestrator.state(),
        "session_id": session_id,
    }))
    .into_response()
}
