//! OpenAI-compatible chat completions backend (`POST {api_url}/chat/completions`).

use crate::config::{api_key_from_env, LlmConfig};
use crate::dialogue::{CompletionOptions, DialogueBackend, DialogueError};
use crate::shared::Message;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

pub const API_KEY_VARS: [&str; 2] = ["NOVA_LLM_API_KEY", "OPENAI_API_KEY"];

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    content: Option<String>,
}

pub struct ChatCompletionsBackend {
    api_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl ChatCompletionsBackend {
    pub fn new(
        api_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, DialogueError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DialogueError::Backend(e.to_string()))?;
        Ok(Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            client,
        })
    }

    /// Endpoint from config, key from `NOVA_LLM_API_KEY` or `OPENAI_API_KEY`.
    pub fn from_config(config: &LlmConfig) -> Result<Self, DialogueError> {
        Self::new(
            config.api_url.clone(),
            api_key_from_env(&API_KEY_VARS),
            Duration::from_secs(config.timeout_secs),
        )
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

#[async_trait]
impl DialogueBackend for ChatCompletionsBackend {
    async fn complete(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<String, DialogueError> {
        let url = format!("{}/chat/completions", self.api_url);
        let body = ChatRequest {
            model: &options.model,
            messages: messages
                .iter()
                .map(|m| ChatMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };

        debug!(model = %options.model, messages = messages.len(), "chat completion request");
        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let res = req.send().await.map_err(|e| {
            if e.is_timeout() {
                DialogueError::Timeout
            } else {
                DialogueError::Backend(format!("request failed: {}", e))
            }
        })?;

        let status = res.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            return Err(DialogueError::RateLimited(body));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(DialogueError::Backend(format!("API error {}: {}", status, body)));
        }

        let parsed: ChatResponse = res.json().await.map_err(|e| {
            if e.is_timeout() {
                DialogueError::Timeout
            } else {
                DialogueError::Malformed(format!("response parse failed: {}", e))
            }
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| DialogueError::Malformed("no choices in response".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_uses_openai_shape() {
        let messages = vec![Message::system("Be brief."), Message::user("hello")];
        let body = ChatRequest {
            model: "gpt-4o-mini",
            messages: messages
                .iter()
                .map(|m| ChatMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            temperature: 0.7,
            max_tokens: 500,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "gpt-4o-mini");
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hello");
        assert_eq!(json["max_tokens"], 500);
    }

    #[test]
    fn blank_key_is_treated_as_missing() {
        let backend =
            ChatCompletionsBackend::new("http://localhost/v1/", Some("  ".into()), Duration::from_secs(1))
                .unwrap();
        assert!(!backend.has_api_key());
        assert_eq!(backend.api_url, "http://localhost/v1");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_backend_error() {
        let backend =
            ChatCompletionsBackend::new("http://127.0.0.1:9", None, Duration::from_secs(2)).unwrap();
        let err = backend
            .complete(&[Message::user("hi")], &CompletionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DialogueError::Backend(_) | DialogueError::Timeout));
    }
}
