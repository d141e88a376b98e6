//! Console conversation loop: greeting, push-to-talk on Enter, typed exit, farewell.

use nova_core::{EventBroadcaster, EventPayload, Role, TurnState};
use nova_voice::TurnOrchestrator;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub fn greeting(name: &str) -> String {
    format!("Hello! I'm {}. How can I help you?", name)
}

pub fn farewell(language: &str) -> &'static str {
    if language.starts_with("fr") {
        "Au revoir! À bientôt!"
    } else {
        "Goodbye! Have a great day!"
    }
}

/// Echo turn progress and the conversation itself to stdout.
pub fn spawn_console_echo(events: &EventBroadcaster, name: String) -> JoinHandle<()> {
    let mut sub = events.subscribe();
    tokio::spawn(async move {
        while let Some(event) = sub.recv().await {
            match event.payload {
                EventPayload::Status { state, error, .. } => match state {
                    TurnState::Listening => println!("🎤 Listening..."),
                    TurnState::Thinking => println!("💭 Thinking..."),
                    TurnState::Error => {
                        if let Some(kind) = error {
                            println!("⚠️  {:?}", kind);
                        }
                    }
                    _ => {}
                },
                EventPayload::Message { role, content } => match role {
                    Role::User => println!("You: {}", content),
                    Role::Assistant => println!("{}: {}", name, content),
                    Role::System => {}
                },
            }
        }
    })
}

/// What a typed line asked for.
#[derive(Debug, PartialEq, Eq)]
pub enum LineOutcome {
    Continue,
    Exit,
}

pub async fn handle_line(orchestrator: &TurnOrchestrator, line: &str) -> LineOutcome {
    let line = line.trim();
    if line.is_empty() {
        if !orchestrator.submit_manual_trigger().await {
            println!("(busy: {})", orchestrator.state());
        }
        return LineOutcome::Continue;
    }
    if orchestrator.handle_command_phrase(line).await {
        return LineOutcome::Exit;
    }
    println!("Press Enter to talk, or type 'exit' to quit.");
    LineOutcome::Continue
}

/// Run until a termination phrase (typed or spoken), Ctrl-C, or a terminate from elsewhere.
pub async fn run_conversation<R>(orchestrator: &TurnOrchestrator, input: R, push_to_talk: bool)
where
    R: AsyncBufRead + Unpin,
{
    let name = orchestrator.settings().read().await.name.clone();
    let hello = greeting(&name);
    println!("{}: {}", name, hello);
    if let Err(e) = orchestrator.announce(&hello).await {
        warn!("greeting not spoken: {}", e);
    }
    if push_to_talk {
        println!("Press Enter to talk. Type 'exit' to quit.");
    } else {
        println!("Say the wake word or press Enter to talk. Type 'exit' to quit.");
    }

    let mut shutdown = orchestrator.shutdown_signal();
    let mut lines = input.lines();
    let mut input_open = true;
    while !*shutdown.borrow_and_update() {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            line = lines.next_line(), if input_open => match line {
                Ok(Some(line)) => {
                    if handle_line(orchestrator, &line).await == LineOutcome::Exit {
                        break;
                    }
                }
                Ok(None) => input_open = false,
                Err(e) => {
                    warn!("console input closed: {}", e);
                    input_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                orchestrator.terminate().await;
                break;
            }
        }
    }

    let bye = farewell(&orchestrator.language().await);
    println!("{}: {}", name, bye);
    if let Err(e) = orchestrator.announce(bye).await {
        warn!("farewell not spoken: {}", e);
    }
}

/// Wake-word callback: start a turn unless one is already running.
pub fn wake_activation(orchestrator: &TurnOrchestrator) -> nova_voice::ActivationCallback {
    let orchestrator = orchestrator.clone();
    Arc::new(move || {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            orchestrator.activate().await;
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::tests::test_state;
    use std::time::Duration;

    #[test]
    fn greeting_and_farewell_texts() {
        assert_eq!(greeting("Nova"), "Hello! I'm Nova. How can I help you?");
        assert_eq!(farewell("en"), "Goodbye! Have a great day!");
        assert_eq!(farewell("fr"), "Au revoir! À bientôt!");
    }

    #[tokio::test]
    async fn typed_exit_ends_the_loop_and_terminates() {
        let state = test_state(None);
        let input: &[u8] = b"hello there\nexit\n";
        tokio::time::timeout(
            Duration::from_secs(5),
            run_conversation(&state.orchestrator, input, true),
        )
        .await
        .expect("loop must end on exit");
        assert!(state.orchestrator.is_terminated());
        assert_eq!(state.orchestrator.state(), TurnState::Idle);
    }

    #[tokio::test]
    async fn terminate_from_elsewhere_ends_the_loop() {
        let state = test_state(None);
        let orchestrator = state.orchestrator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            orchestrator.terminate().await;
        });
        let input: &[u8] = b"";
        tokio::time::timeout(
            Duration::from_secs(5),
            run_conversation(&state.orchestrator, input, false),
        )
        .await
        .expect("loop must end on terminate");
    }

    #[tokio::test]
    async fn enter_starts_a_turn() {
        let state = test_state(None);
        let mut sub = state.events.subscribe();
        assert_eq!(handle_line(&state.orchestrator, "").await, LineOutcome::Continue);
        let first = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.state(), Some(TurnState::Activating));
    }
}
