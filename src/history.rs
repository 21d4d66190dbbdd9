use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::compact;
use crate::message::{Content, ContentPart, Message, MessageUsage, Role};
use crate::models::{LanguageModel, ModelLimits, PromptMessage, PromptPart, PromptRole};
use crate::usage::Usage;

/// Reserve 20% of a small (32k) window.
pub const MIN_TOKEN_THRESHOLD: u64 = 25_600;
const COMPRESSION_RATIO: f64 = 0.8;

/// Persistence side effect fired for every appended message.
pub type OnMessage = Arc<dyn Fn(&Message) -> anyhow::Result<()> + Send + Sync>;

/// The persistence callback rejected a message. The message is not added.
#[derive(Debug, thiserror::Error)]
#[error("failed to persist message {uuid}: {source}")]
pub struct PersistError {
    pub uuid: Uuid,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressOutcome {
    pub compressed: bool,
}

/// Append-only message arena. Parent links are uuids, so abandoned branches
/// stay in the arena while [`History::active_path`] only sees the live lineage.
#[derive(Clone, Default)]
pub struct History {
    messages: Vec<Message>,
    on_message: Option<OnMessage>,
}

impl fmt::Debug for History {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("History")
            .field("messages", &self.messages.len())
            .field("on_message", &self.on_message.is_some())
            .finish()
    }
}

impl History {
    pub fn new(messages: Vec<Message>, on_message: Option<OnMessage>) -> Self {
        Self { messages, on_message }
    }

    pub fn set_on_message(&mut self, on_message: Option<OnMessage>) {
        self.on_message = on_message;
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Fires the persistence callback, then pushes the message. A message the
    /// callback rejects is not kept in memory either.
    pub fn append(&mut self, message: Message) -> Result<Uuid, PersistError> {
        if let Some(parent) = message.parent_uuid {
            if !self.messages.iter().any(|m| m.uuid == parent) {
                warn!(uuid = %message.uuid, parent = %parent, "message parent not present in history");
            }
        }
        if let Some(cb) = &self.on_message {
            cb(&message).map_err(|e| PersistError { uuid: message.uuid, source: e.into() })?;
        }
        let uuid = message.uuid;
        self.messages.push(message);
        Ok(uuid)
    }

    /// Appends a new message whose parent is the current tip.
    pub fn add_message(
        &mut self,
        role: Role,
        content: Content,
        model: Option<String>,
        usage: Option<MessageUsage>,
    ) -> Result<Uuid, PersistError> {
        let parent = self.messages.last().map(|m| m.uuid);
        let mut message = Message::new(role, content, parent);
        message.model = model;
        message.usage = usage;
        self.append(message)
    }

    pub fn active_path(&self) -> Vec<Message> {
        active_path(&self.messages)
    }

    /// The lineage ending at `uuid` (inclusive), oldest first. Empty if unknown.
    pub fn messages_to(&self, uuid: Uuid) -> Vec<Message> {
        let index = index_by_uuid(&self.messages);
        let Some(&start) = index.get(&uuid) else { return Vec::new() };
        let visited = walk_back(&self.messages, &index, start);
        self.messages.iter().filter(|m| visited.contains(&m.uuid)).cloned().collect()
    }

    pub fn to_prompt_messages(&self) -> Vec<PromptMessage> {
        self.active_path().iter().filter_map(to_prompt_message).collect()
    }

    /// Summarizes the active path into a new root message when the last
    /// assistant turn used more tokens than the model can comfortably hold.
    pub async fn compress(&mut self, model: &dyn LanguageModel, cancel: &CancellationToken) -> anyhow::Result<CompressOutcome> {
        let path = self.active_path();
        let Some(last_assistant) = path.iter().rev().find(|m| m.role == Role::Assistant) else {
            return Ok(CompressOutcome { compressed: false });
        };
        let used = Usage::from_message_usage(last_assistant.usage.as_ref());
        let threshold = compression_threshold(model.limits());
        if used.total_tokens() < threshold {
            return Ok(CompressOutcome { compressed: false });
        }
        debug!(used = used.total_tokens(), threshold, messages = path.len(), "compacting history");
        let summary = compact::summarize(model, self.to_prompt_messages(), cancel).await?;
        let message = Message::user(Content::Parts(vec![ContentPart::Text { text: summary }]), None);
        self.append(message)?;
        Ok(CompressOutcome { compressed: true })
    }
}

pub fn compression_threshold(limits: ModelLimits) -> u64 {
    let usable = limits.context.saturating_sub(limits.output.min(limits.context / 2));
    let scaled = (usable as f64 * COMPRESSION_RATIO) as u64;
    scaled.max(MIN_TOKEN_THRESHOLD)
}

fn index_by_uuid(messages: &[Message]) -> HashMap<Uuid, usize> {
    messages.iter().enumerate().map(|(i, m)| (m.uuid, i)).collect()
}

fn walk_back(messages: &[Message], index: &HashMap<Uuid, usize>, start: usize) -> HashSet<Uuid> {
    let mut visited = HashSet::new();
    let mut current = Some(start);
    while let Some(i) = current {
        let message = &messages[i];
        if !visited.insert(message.uuid) {
            break;
        }
        current = message.parent_uuid.and_then(|p| index.get(&p).copied());
    }
    visited
}

/// Messages reachable from the chronologically last one through parent links,
/// in original append order.
pub fn active_path(messages: &[Message]) -> Vec<Message> {
    if messages.is_empty() {
        return Vec::new();
    }
    let index = index_by_uuid(messages);
    let visited = walk_back(messages, &index, messages.len() - 1);
    messages.iter().filter(|m| visited.contains(&m.uuid)).cloned().collect()
}

fn to_prompt_message(message: &Message) -> Option<PromptMessage> {
    let role = match message.role {
        Role::User => PromptRole::User,
        Role::Assistant => PromptRole::Assistant,
        Role::Tool => PromptRole::Tool,
    };
    let parts: Vec<PromptPart> = message
        .content
        .parts()
        .into_iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } => Some(PromptPart::Text { text }),
            ContentPart::Reasoning { text } => Some(PromptPart::Reasoning { text }),
            ContentPart::Image { data, mime_type } => Some(PromptPart::Image { data, mime_type }),
            ContentPart::ToolUse { id, name, input, .. } => Some(PromptPart::ToolCall { id, name, input }),
            ContentPart::ToolResult { tool_call_id, tool_name, result, .. } => Some(PromptPart::ToolResult {
                id: tool_call_id,
                name: tool_name,
                output: result.text(),
                is_error: result.is_error,
            }),
        })
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(PromptMessage { role, parts })
}
