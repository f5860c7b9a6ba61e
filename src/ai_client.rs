//! Generative text providers used for topic labeling
//!
//! OpenAI chat completions, Anthropic messages, and a local Ollama backend
//! behind one [`GenerativeProvider`] trait.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::settings::{GenerationBackend, Settings};

/// Client-side timeout for every provider request. The pipeline itself
/// enforces no stage timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[async_trait]
pub trait GenerativeProvider: Send + Sync {
    /// Single-turn completion of `prompt`
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// Model the provider sends requests to, if it has one
    fn model(&self) -> Option<&str> {
        None
    }
}

pub(crate) fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))
}

/// Turn a non-2xx response into a provider error carrying the body
pub(crate) async fn check_status(response: reqwest::Response, provider: &str) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(Error::Provider(format!("{} API error {}: {}", provider, status, body)))
}

/// Build the provider selected in settings
pub fn from_settings(settings: &Settings) -> Result<Box<dyn GenerativeProvider>> {
    let model = settings.generation_model();
    match settings.generation_backend {
        GenerationBackend::OpenAi => {
            let key = settings
                .openai_api_key()
                .ok_or_else(|| Error::Config("OPENAI_API_KEY not set".to_string()))?;
            Ok(Box::new(OpenAiChat::new(key, model)?))
        }
        GenerationBackend::Anthropic => {
            let key = settings
                .anthropic_api_key()
                .ok_or_else(|| Error::Config("ANTHROPIC_API_KEY not set".to_string()))?;
            Ok(Box::new(AnthropicChat::new(key, model)?))
        }
        GenerationBackend::Ollama => Ok(Box::new(OllamaChat::new(settings.ollama_url(), model)?)),
    }
}

// ==================== OpenAI ====================

#[derive(Debug, Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessageContent,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessageContent {
    #[serde(default)]
    content: Option<String>,
}

pub struct OpenAiChat {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiChat {
    pub fn new(api_key: String, model: String) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            api_key,
            model,
            base_url: "https://api.openai.com/v1".to_string(),
        })
    }
}

#[async_trait]
impl GenerativeProvider for OpenAiChat {
    fn model(&self) -> Option<&str> {
        Some(&self.model)
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let request = OpenAiRequest {
            model: &self.model,
            messages: vec![ChatMessage { role: "user", content: prompt }],
            temperature: 0.2,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;
        let response = check_status(response, "OpenAI").await?;

        let api_response: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| Error::Provider(format!("Failed to parse OpenAI response: {}", e)))?;

        api_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.unwrap_or_default())
            .ok_or_else(|| Error::Provider("No response from OpenAI".to_string()))
    }
}

// ==================== Anthropic ====================

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

pub struct AnthropicChat {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl AnthropicChat {
    pub fn new(api_key: String, model: String) -> Result<Self> {
        Ok(Self { client: http_client()?, api_key, model })
    }
}

#[async_trait]
impl GenerativeProvider for AnthropicChat {
    fn model(&self) -> Option<&str> {
        Some(&self.model)
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let request = AnthropicRequest {
            model: &self.model,
            max_tokens: 50,
            messages: vec![ChatMessage { role: "user", content: prompt }],
        };

        let response = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await?;
        let response = check_status(response, "Anthropic").await?;

        let api_response: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| Error::Provider(format!("Failed to parse Anthropic response: {}", e)))?;

        Ok(api_response
            .content
            .into_iter()
            .next()
            .map(|c| c.text)
            .unwrap_or_default())
    }
}

// ==================== Ollama ====================

#[derive(Debug, Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    #[serde(default)]
    response: String,
}

pub struct OllamaChat {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaChat {
    pub fn new(base_url: String, model: String) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        })
    }
}

#[async_trait]
impl GenerativeProvider for OllamaChat {
    fn model(&self) -> Option<&str> {
        Some(&self.model)
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let request = OllamaGenerateRequest { model: &self.model, prompt, stream: false };

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&request)
            .send()
            .await?;
        let response = check_status(response, "Ollama").await?;

        let api_response: OllamaGenerateResponse = response
            .json()
            .await
            .map_err(|e| Error::Provider(format!("Failed to parse Ollama response: {}", e)))?;

        Ok(api_response.response)
    }
}
