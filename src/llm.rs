// src/llm.rs

//! Minimal OpenAI-compatible chat-completions client.
//!
//! Both collaborators (image extraction and report generation) talk to the
//! model through [`ChatClient::complete`] and treat the answer as opaque text.

use crate::config::{LlmBackend, LlmSection};
use crate::error::{ConfigError, LlmError};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Environment variable holding the API key for the remote backend.
pub const API_KEY_ENV: &str = "LLM_API_KEY";

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: MessageContent::Text(text.into()),
        }
    }

    /// A user turn carrying one inline image followed by an instruction.
    pub fn user_with_image(data_url: String, text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: MessageContent::Parts(vec![
                ContentPart::ImageUrl {
                    image_url: ImageUrl { url: data_url },
                },
                ContentPart::Text { text: text.into() },
            ]),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// Resolved endpoint configuration ready to make API calls.
#[derive(Debug, Clone)]
pub struct ResolvedEndpoint {
    pub backend: LlmBackend,
    pub base_url: String,
    pub model: String,
    pub api_key: String,
}

impl ResolvedEndpoint {
    /// Resolve the LLM config section into a concrete endpoint.
    pub fn resolve(llm: &LlmSection) -> Result<Self, ConfigError> {
        match llm.backend {
            LlmBackend::Ollama => {
                info!(
                    url = %llm.ollama.base_url,
                    model = %llm.ollama.model,
                    "Using Ollama (local) backend"
                );
                Ok(Self {
                    backend: LlmBackend::Ollama,
                    base_url: llm.ollama.base_url.clone(),
                    model: llm.ollama.model.clone(),
                    api_key: "ollama".to_string(), // required by API but ignored
                })
            }
            LlmBackend::Remote => {
                let api_key = std::env::var(API_KEY_ENV).map_err(|_| ConfigError::MissingApiKey)?;
                info!(
                    url = %llm.remote.base_url,
                    model = %llm.remote.model,
                    "Using remote API backend"
                );
                Ok(Self {
                    backend: LlmBackend::Remote,
                    base_url: llm.remote.base_url.clone(),
                    model: llm.remote.model.clone(),
                    api_key,
                })
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatClient {
    client: Client,
    endpoint: ResolvedEndpoint,
}

impl ChatClient {
    pub fn new(endpoint: ResolvedEndpoint, timeout: Duration) -> Result<Self, LlmError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint })
    }

    pub fn model(&self) -> &str {
        &self.endpoint.model
    }

    /// Fail fast when a local Ollama server is not running.
    pub async fn ensure_ready(&self) -> Result<(), LlmError> {
        if self.endpoint.backend != LlmBackend::Ollama {
            return Ok(());
        }

        // Ollama's health endpoint is at the root (not under /v1)
        let url = health_url(&self.endpoint.base_url);
        match self
            .client
            .get(url)
            .timeout(Duration::from_secs(3))
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                info!("Ollama server is reachable");
                Ok(())
            }
            Ok(resp) => {
                warn!(status = %resp.status(), "Ollama server returned non-OK status");
                Err(LlmError::Unreachable {
                    url: url.to_string(),
                })
            }
            Err(e) => {
                warn!(error = %e, "Ollama server not reachable");
                Err(LlmError::Unreachable {
                    url: url.to_string(),
                })
            }
        }
    }

    /// Send `messages` and return the first choice's text.
    pub async fn complete(&self, messages: &[ChatMessage], max_tokens: u32) -> Result<String, LlmError> {
        let request = ChatRequest {
            model: &self.endpoint.model,
            messages,
            temperature: 0.0,
            max_tokens,
        };

        let url = format!("{}/chat/completions", self.endpoint.base_url.trim_end_matches('/'));
        debug!(url = %url, messages = messages.len(), "Sending chat completion");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.endpoint.api_key))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api { status, body });
        }

        let chat_response: ChatResponse = response.json().await?;
        chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(LlmError::EmptyResponse)
    }
}

fn health_url(base_url: &str) -> &str {
    base_url.trim_end_matches('/').trim_end_matches("/v1")
}
