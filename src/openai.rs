use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::models::{LanguageModel, ModelError, ModelLimits, ModelRequest, ModelStream, PromptMessage, PromptPart, PromptRole, StreamEvent, ToolSchema};
use crate::usage::Usage;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Streaming chat-completions client for any OpenAI-compatible endpoint.
#[derive(Clone)]
pub struct OpenAICompatible {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub limits: ModelLimits,
    client: reqwest::Client,
}

impl OpenAICompatible {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, model: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), api_key, model: model.into(), limits: ModelLimits::default(), client: reqwest::Client::new() }
    }

    /// `OPENAI_BASE_URL` (or `base_url`, or the public endpoint) and `OPENAI_API_KEY`.
    pub fn from_env(model: impl Into<String>, base_url: Option<String>) -> Self {
        let base_url = std::env::var("OPENAI_BASE_URL").ok().or(base_url).unwrap_or_else(|| DEFAULT_BASE_URL.into());
        let api_key = std::env::var("OPENAI_API_KEY").ok();
        Self::new(base_url, api_key, model)
    }

    fn endpoint(&self) -> Result<url::Url, ModelError> {
        let base = format!("{}/", self.base_url.trim_end_matches('/'));
        url::Url::parse(&base)
            .and_then(|u| u.join("chat/completions"))
            .map_err(|e| ModelError::fatal(format!("invalid base url {}: {e}", self.base_url)))
    }
}

fn tool_to_oai(tool: &ToolSchema) -> Value {
    json!({
        "type": "function",
        "function": {"name": tool.name, "description": tool.description, "parameters": tool.parameters}
    })
}

/// Converts prompt messages to chat-completions messages. Tool messages fan
/// out into one `tool` message per result.
pub fn prompt_to_oai(prompt: &[PromptMessage]) -> Vec<Value> {
    let mut out = Vec::with_capacity(prompt.len());
    for msg in prompt {
        match msg.role {
            PromptRole::System => out.push(json!({"role": "system", "content": msg.text()})),
            PromptRole::User => {
                let has_images = msg.parts.iter().any(|p| matches!(p, PromptPart::Image { .. }));
                if !has_images {
                    out.push(json!({"role": "user", "content": msg.text()}));
                    continue;
                }
                let content: Vec<Value> = msg
                    .parts
                    .iter()
                    .filter_map(|p| match p {
                        PromptPart::Text { text } => Some(json!({"type": "text", "text": text})),
                        PromptPart::Image { data, mime_type } => {
                            Some(json!({"type": "image_url", "image_url": {"url": format!("data:{mime_type};base64,{data}")}}))
                        }
                        _ => None,
                    })
                    .collect();
                out.push(json!({"role": "user", "content": content}));
            }
            PromptRole::Assistant => {
                let text = msg.text();
                let calls: Vec<Value> = msg
                    .parts
                    .iter()
                    .filter_map(|p| match p {
                        PromptPart::ToolCall { id, name, input } => {
                            Some(json!({"id": id, "type": "function", "function": {"name": name, "arguments": input.to_string()}}))
                        }
                        _ => None,
                    })
                    .collect();
                let mut m = json!({"role": "assistant", "content": if text.is_empty() { Value::Null } else { Value::String(text) }});
                if !calls.is_empty() {
                    m["tool_calls"] = Value::Array(calls);
                }
                out.push(m);
            }
            PromptRole::Tool => {
                for p in &msg.parts {
                    if let PromptPart::ToolResult { id, output, .. } = p {
                        out.push(json!({"role": "tool", "tool_call_id": id, "content": output}));
                    }
                }
            }
        }
    }
    out
}

pub fn build_body(model: &str, req: &ModelRequest) -> Value {
    let mut body = json!({
        "model": model,
        "messages": prompt_to_oai(&req.prompt),
        "stream": true,
        "stream_options": {"include_usage": true},
    });
    if !req.tools.is_empty() {
        body["tools"] = Value::Array(req.tools.iter().map(tool_to_oai).collect());
    }
    if let Some(t) = req.temperature {
        body["temperature"] = json!(t);
    }
    body
}

/// Splits a server-sent-event byte stream into `data:` payloads.
///
/// Bytes are buffered until a full line arrives, so a UTF-8 sequence split
/// across network chunks is decoded whole.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some(data) = line.strip_prefix("data:") {
                out.push(data.trim_start().to_string());
            }
        }
        out
    }
}

#[derive(Debug, Deserialize)]
struct OaiChunk {
    #[serde(default)]
    choices: Vec<OaiChoice>,
    usage: Option<OaiUsage>,
    error: Option<OaiError>,
}

#[derive(Debug, Deserialize)]
struct OaiChoice {
    #[serde(default)]
    delta: OaiDelta,
}

#[derive(Debug, Default, Deserialize)]
struct OaiDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OaiToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct OaiToolCallDelta {
    #[serde(default)]
    index: u64,
    id: Option<String>,
    function: Option<OaiFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct OaiFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OaiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct OaiError {
    message: String,
    code: Option<Value>,
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Folds chat-completion chunks into stream events. Tool calls arrive in
/// fragments keyed by index and are only emitted once the stream ends.
#[derive(Debug, Default)]
pub struct ChunkAccumulator {
    calls: BTreeMap<u64, PartialCall>,
    usage: Usage,
}

impl ChunkAccumulator {
    pub fn apply(&mut self, data: &str) -> Vec<StreamEvent> {
        let chunk: OaiChunk = match serde_json::from_str(data) {
            Ok(c) => c,
            Err(e) => return vec![StreamEvent::Error(ModelError::fatal(format!("invalid stream chunk: {e}")))],
        };
        if let Some(err) = chunk.error {
            let mut e = ModelError::fatal(err.message);
            if let Some(code) = err.code {
                e = e.with_code(code.as_str().map(str::to_string).unwrap_or_else(|| code.to_string()));
            }
            return vec![StreamEvent::Error(e)];
        }
        let mut events = Vec::new();
        for choice in chunk.choices {
            if let Some(r) = choice.delta.reasoning_content.filter(|s| !s.is_empty()) {
                events.push(StreamEvent::ReasoningDelta(r));
            }
            if let Some(t) = choice.delta.content.filter(|s| !s.is_empty()) {
                events.push(StreamEvent::TextDelta(t));
            }
            for tc in choice.delta.tool_calls {
                let slot = self.calls.entry(tc.index).or_default();
                if let Some(id) = tc.id {
                    slot.id = id;
                }
                if let Some(f) = tc.function {
                    if let Some(name) = f.name {
                        slot.name.push_str(&name);
                    }
                    if let Some(args) = f.arguments {
                        slot.arguments.push_str(&args);
                    }
                }
            }
        }
        if let Some(u) = chunk.usage {
            self.usage = Usage::new(u.prompt_tokens, u.completion_tokens);
        }
        events
    }

    pub fn finish(self) -> Vec<StreamEvent> {
        let mut events: Vec<StreamEvent> = self
            .calls
            .into_values()
            .filter(|c| !c.name.is_empty())
            .map(|c| StreamEvent::ToolCall { id: c.id, name: c.name, input: c.arguments })
            .collect();
        events.push(StreamEvent::Finish { usage: self.usage });
        events
    }
}

#[async_trait]
impl LanguageModel for OpenAICompatible {
    fn id(&self) -> String {
        self.model.clone()
    }

    fn limits(&self) -> ModelLimits {
        self.limits
    }

    async fn stream(&self, req: ModelRequest, cancel: CancellationToken) -> Result<ModelStream, ModelError> {
        let url = self.endpoint()?;
        let body = build_body(&self.model, &req);
        let mut rb = self.client.post(url).json(&body);
        if let Some(key) = &self.api_key {
            rb = rb.bearer_auth(key);
        }
        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ModelError::fatal("request canceled")),
            resp = rb.send() => resp.map_err(|e| ModelError::retryable(format!("model request failed: {e}")))?,
        };
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ModelError::from_status(status.as_u16(), format!("model call failed: {status} {text}")));
        }
        debug!(model = %self.model, "model stream opened");

        let mut bytes = resp.bytes_stream();
        let stream = async_stream::stream! {
            let mut decoder = SseDecoder::default();
            let mut acc = ChunkAccumulator::default();
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    next = bytes.next() => next,
                };
                let chunk = match next {
                    Some(Ok(b)) => b,
                    Some(Err(e)) => {
                        yield StreamEvent::Error(ModelError::retryable(format!("stream interrupted: {e}")));
                        return;
                    }
                    None => break,
                };
                let mut done = false;
                for data in decoder.push(&chunk) {
                    if data == "[DONE]" {
                        done = true;
                        break;
                    }
                    for event in acc.apply(&data) {
                        let fatal = matches!(event, StreamEvent::Error(_));
                        yield event;
                        if fatal {
                            return;
                        }
                    }
                }
                if done {
                    break;
                }
            }
            for event in acc.finish() {
                yield event;
            }
        };
        Ok(stream.boxed())
    }
}
