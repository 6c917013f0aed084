//! Local language-model capability.
//!
//! [`LanguageModel`] and [`ModelSession`] describe what the watcher needs from
//! an on-device model: an availability check, stateful multimodal sessions and
//! sampling parameters. [`OllamaLanguageModel`] implements them against a local
//! Ollama server.

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;

/// What the capability itself reports about the configured model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelAvailability {
    Readily,
    AfterDownload,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub mime: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPart {
    Text(String),
    Image(ImagePayload),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTurn {
    pub role: Role,
    pub content: Vec<ContentPart>,
}

impl PromptTurn {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: vec![ContentPart::Text(text.into())],
        }
    }

    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text(text) => Some(text.as_str()),
                ContentPart::Image(_) => None,
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn images(&self) -> impl Iterator<Item = &ImagePayload> {
        self.content.iter().filter_map(|part| match part {
            ContentPart::Image(image) => Some(image),
            ContentPart::Text(_) => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    Text,
    Image,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedOutput {
    pub modality: Modality,
    pub languages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub initial_prompts: Vec<PromptTurn>,
    pub expected_inputs: Vec<Modality>,
    pub expected_outputs: Vec<ExpectedOutput>,
    pub temperature: Option<f32>,
    pub top_k: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelParams {
    pub default_temperature: f32,
    pub max_temperature: f32,
    pub default_top_k: u32,
    pub max_top_k: u32,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            default_temperature: 0.8,
            max_temperature: 2.0,
            default_top_k: 40,
            max_top_k: 128,
        }
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn availability(&self) -> Result<ModelAvailability>;
    async fn create(&self, config: SessionConfig) -> Result<Box<dyn ModelSession>>;
    async fn params(&self) -> Result<ModelParams>;
}

/// A conversational context. Turns sent through [`ModelSession::prompt`]
/// accumulate until the session is destroyed.
#[async_trait]
pub trait ModelSession: Send + Sync {
    async fn prompt(&mut self, turns: Vec<PromptTurn>) -> Result<String>;
    async fn clone_session(&self) -> Result<Box<dyn ModelSession>>;
    fn destroy(&mut self);
}

#[derive(Debug, Clone)]
pub struct OllamaLanguageModel {
    client: Client,
    endpoint: String,
    model: String,
}

impl OllamaLanguageModel {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            model: model.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    async fn installed(&self) -> Result<bool> {
        let response = self
            .client
            .get(self.url("/api/tags"))
            .send()
            .await
            .context("failed to reach Ollama")?;
        if !response.status().is_success() {
            bail!("Ollama /api/tags returned {}", response.status());
        }
        let json: Value = response
            .json()
            .await
            .context("failed to decode Ollama model list")?;
        Ok(model_listed(&json, &self.model))
    }

    async fn show(&self) -> Result<Value> {
        let response = self
            .client
            .post(self.url("/api/show"))
            .json(&json!({ "model": self.model }))
            .send()
            .await
            .context("failed to call Ollama /api/show")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Ollama /api/show error {status}: {body}");
        }
        response
            .json()
            .await
            .context("failed to decode Ollama model details")
    }

    async fn pull(&self) -> Result<()> {
        tracing::info!(model = %self.model, "downloading model");
        let response = self
            .client
            .post(self.url("/api/pull"))
            .json(&json!({ "model": self.model, "stream": false }))
            .send()
            .await
            .context("failed to call Ollama /api/pull")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Ollama model download failed {status}: {body}");
        }
        Ok(())
    }
}

#[async_trait]
impl LanguageModel for OllamaLanguageModel {
    async fn availability(&self) -> Result<ModelAvailability> {
        if !self.installed().await? {
            return Ok(ModelAvailability::AfterDownload);
        }
        let details = self.show().await?;
        if supports_vision(&details) {
            Ok(ModelAvailability::Readily)
        } else {
            Ok(ModelAvailability::Unavailable)
        }
    }

    async fn create(&self, config: SessionConfig) -> Result<Box<dyn ModelSession>> {
        if !self.installed().await? {
            self.pull().await?;
        }

        if config.expected_inputs.contains(&Modality::Image) {
            let details = self.show().await?;
            if !supports_vision(&details) {
                bail!("model {} does not accept image input", self.model);
            }
        }

        let mut options = serde_json::Map::new();
        if let Some(temperature) = config.temperature {
            options.insert("temperature".into(), json!(temperature));
        }
        if let Some(top_k) = config.top_k {
            options.insert("top_k".into(), json!(top_k));
        }

        Ok(Box::new(OllamaSession {
            model: self.clone(),
            history: config.initial_prompts.iter().map(chat_message).collect(),
            options: Value::Object(options),
            destroyed: false,
        }))
    }

    async fn params(&self) -> Result<ModelParams> {
        let details = self.show().await?;
        let raw = details
            .get("parameters")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Ok(parse_parameters(raw))
    }
}

#[derive(Debug)]
struct OllamaSession {
    model: OllamaLanguageModel,
    history: Vec<Value>,
    options: Value,
    destroyed: bool,
}

#[async_trait]
impl ModelSession for OllamaSession {
    async fn prompt(&mut self, turns: Vec<PromptTurn>) -> Result<String> {
        if self.destroyed {
            bail!("session has been destroyed");
        }

        let mut messages = self.history.clone();
        messages.extend(turns.iter().map(chat_message));

        let body = json!({
            "model": self.model.model,
            "messages": messages,
            "stream": false,
            "options": self.options,
        });

        let response = self
            .model
            .client
            .post(self.model.url("/api/chat"))
            .json(&body)
            .send()
            .await
            .context("failed to call Ollama /api/chat")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Ollama API error {status}: {body}");
        }

        let json: Value = response
            .json()
            .await
            .context("failed to decode Ollama chat response")?;
        let reply = json
            .pointer("/message/content")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .ok_or_else(|| {
                let message = json
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("no message content in response");
                anyhow!("Ollama returned no text: {message}")
            })?;

        messages.push(json!({ "role": Role::Assistant.as_str(), "content": reply }));
        self.history = messages;
        Ok(reply)
    }

    async fn clone_session(&self) -> Result<Box<dyn ModelSession>> {
        if self.destroyed {
            bail!("session has been destroyed");
        }
        Ok(Box::new(OllamaSession {
            model: self.model.clone(),
            history: self.history.clone(),
            options: self.options.clone(),
            destroyed: false,
        }))
    }

    fn destroy(&mut self) {
        self.history.clear();
        self.destroyed = true;
    }
}

fn chat_message(turn: &PromptTurn) -> Value {
    let images: Vec<String> = turn
        .images()
        .map(|image| general_purpose::STANDARD.encode(&image.bytes))
        .collect();
    if images.is_empty() {
        json!({ "role": turn.role.as_str(), "content": turn.text() })
    } else {
        json!({ "role": turn.role.as_str(), "content": turn.text(), "images": images })
    }
}

fn model_listed(tags: &Value, model: &str) -> bool {
    let wanted = normalize_tag(model);
    tags.get("models")
        .and_then(Value::as_array)
        .map(|models| {
            models.iter().any(|entry| {
                ["name", "model"].iter().any(|key| {
                    entry
                        .get(*key)
                        .and_then(Value::as_str)
                        .is_some_and(|name| normalize_tag(name) == wanted)
                })
            })
        })
        .unwrap_or(false)
}

fn normalize_tag(name: &str) -> String {
    if name.contains(':') {
        name.to_string()
    } else {
        format!("{name}:latest")
    }
}

fn supports_vision(details: &Value) -> bool {
    if let Some(capabilities) = details.get("capabilities").and_then(Value::as_array) {
        return capabilities
            .iter()
            .any(|cap| cap.as_str() == Some("vision"));
    }
    // Older servers omit capabilities; a projector entry means a vision model.
    details.get("projector_info").is_some()
}

fn parse_parameters(raw: &str) -> ModelParams {
    let mut params = ModelParams::default();
    for line in raw.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        match key {
            "temperature" => {
                if let Ok(value) = value.parse() {
                    params.default_temperature = value;
                }
            }
            "top_k" => {
                if let Ok(value) = value.parse() {
                    params.default_top_k = value;
                }
            }
            _ => {}
        }
    }
    params
}
