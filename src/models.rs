use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::usage::Usage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelLimits {
    /// Context window in tokens.
    pub context: u64,
    /// Maximum generated tokens per request.
    pub output: u64,
}

impl Default for ModelLimits {
    fn default() -> Self {
        Self { context: 128_000, output: 8_192 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PromptPart {
    Text { text: String },
    Reasoning { text: String },
    Image { data: String, mime_type: String },
    ToolCall { id: String, name: String, input: Value },
    ToolResult { id: String, name: String, output: String, is_error: bool },
}

/// One model-facing message in a prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub parts: Vec<PromptPart>,
}

impl PromptMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self { role: PromptRole::System, parts: vec![PromptPart::Text { text: text.into() }] }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self { role: PromptRole::User, parts: vec![PromptPart::Text { text: text.into() }] }
    }

    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                PromptPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Default)]
pub struct ModelRequest {
    pub prompt: Vec<PromptMessage>,
    pub tools: Vec<ToolSchema>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    ReasoningDelta(String),
    /// A complete tool call; `input` is the raw JSON text the model produced.
    ToolCall { id: String, name: String, input: String },
    Finish { usage: Usage },
    Error(ModelError),
}

pub type ModelStream = BoxStream<'static, StreamEvent>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ModelError {
    pub message: String,
    pub status: Option<u16>,
    pub code: Option<String>,
    pub retryable: bool,
}

impl ModelError {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self { message: message.into(), status: None, code: None, retryable: false }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self { message: message.into(), status: None, code: None, retryable: true }
    }

    /// Rate limits, timeouts and server-side failures are worth another attempt.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let retryable = matches!(status, 408 | 409 | 429) || status >= 500;
        Self { message: message.into(), status: Some(status), code: None, retryable }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// A streaming model handle.
///
/// Implementations must stop producing events once `cancel` fires.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// `provider/model` identifier recorded on assistant messages.
    fn id(&self) -> String;
    fn limits(&self) -> ModelLimits {
        ModelLimits::default()
    }
    async fn stream(&self, req: ModelRequest, cancel: CancellationToken) -> Result<ModelStream, ModelError>;
}
