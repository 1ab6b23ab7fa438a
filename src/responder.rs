//! Reply generation against an OpenAI-compatible chat completions endpoint

use crate::config::LlmConfig;
use crate::turn::{CollaboratorError, ResponseGenerator};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: Option<String>,
}

/// System prompt, then the running history as one assistant turn, then the user's words
fn build_request<'a>(model: &'a str, prompt: &'a str, system: &'a str, history: &'a str) -> ChatRequest<'a> {
    let mut messages = vec![ChatMessage {
        role: "system",
        content: system,
    }];
    if !history.is_empty() {
        messages.push(ChatMessage {
            role: "assistant",
            content: history,
        });
    }
    messages.push(ChatMessage {
        role: "user",
        content: prompt,
    });
    ChatRequest { model, messages }
}

/// Pull the spoken text out of a model reply.
///
/// Models prompted for structured output answer `{"message": "..."}`; anything
/// else is taken as plain text.
pub fn extract_reply(raw: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(raw.trim()) {
        Ok(serde_json::Value::Object(map)) => match map.get("message") {
            Some(serde_json::Value::String(message)) => message.trim().to_string(),
            _ => raw.trim().to_string(),
        },
        _ => raw.trim().to_string(),
    }
}

/// Blocking chat completions client.
///
/// Build and drop it outside any async runtime; call it from
/// `spawn_blocking`.
pub struct ChatCompletionsClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl ChatCompletionsClient {
    pub fn new(config: &LlmConfig) -> Result<Self, CollaboratorError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| CollaboratorError::Generator(format!("building HTTP client: {}", e)))?;

        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());
        if api_key.is_none() {
            warn!("{} is not set; requests go out unauthenticated", config.api_key_env);
        }

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
        })
    }
}

impl ResponseGenerator for ChatCompletionsClient {
    fn generate(
        &self,
        model: &str,
        prompt: &str,
        system: &str,
        history: &str,
    ) -> Result<String, CollaboratorError> {
        let body = build_request(model, prompt, system, history);
        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .map_err(|e| CollaboratorError::Generator(format!("request failed: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(CollaboratorError::Generator(format!(
                "HTTP {}: {}",
                status, body
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .map_err(|e| CollaboratorError::Generator(format!("bad response body: {}", e)))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| CollaboratorError::Generator("response had no content".to_string()))?;

        debug!("Model replied with {} chars", content.chars().count());
        Ok(extract_reply(&content))
    }
}
