//! Live dashboard channel over WebSocket.
//!
//! Server → client: every [`DashboardEvent`] as JSON (`type: "status" | "message"`), plus
//! `{"type":"status","connected":true}` on connect.
//! Client → server: `{"type":"start_listening"}` and `{"type":"stop_listening"}`.

use crate::api::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use nova_voice::TurnOrchestrator;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    StartListening,
    StopListening,
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    info!(target: "nova::live", "dashboard connected");
    let (mut sender, mut receiver) = socket.split();

    let hello = json!({ "type": "status", "connected": true }).to_string();
    if sender.send(Message::Text(hello)).await.is_err() {
        return;
    }

    let mut events = state.events.subscribe();
    let forward = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(t) => t,
                Err(e) => {
                    warn!(target: "nova::live", "could not encode event: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientCommand>(&text) {
                Ok(cmd) => apply_command(&state.orchestrator, cmd).await,
                Err(e) => debug!(target: "nova::live", "ignoring client message {:?}: {}", text, e),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(target: "nova::live", "websocket error: {}", e);
                break;
            }
        }
    }

    forward.abort();
    info!(target: "nova::live", "dashboard disconnected");
}

/// Both commands are idempotent: starting while a turn runs, or stopping while Idle, does nothing.
pub async fn apply_command(orchestrator: &TurnOrchestrator, cmd: ClientCommand) {
    match cmd {
        ClientCommand::StartListening => {
            if !orchestrator.activate().await {
                debug!(target: "nova::live", "start_listening ignored in state {}", orchestrator.state());
            }
        }
        ClientCommand::StopListening => {
            orchestrator.stop().await;
        }
    }
}
