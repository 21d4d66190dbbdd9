use serde::{Deserialize, Serialize};

use crate::message::MessageUsage;

/// Token counts for one turn or a running total.
///
/// Only ever built additively: `total_tokens` is kept equal to
/// `prompt_tokens + completion_tokens` by every constructor and by `add`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}

impl Usage {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }

    /// Usage recorded on an assistant message, if any.
    pub fn from_message_usage(usage: Option<&MessageUsage>) -> Self {
        usage
            .map(|u| Self::new(u.input_tokens, u.output_tokens))
            .unwrap_or_default()
    }

    pub fn prompt_tokens(&self) -> u64 {
        self.prompt_tokens
    }

    pub fn completion_tokens(&self) -> u64 {
        self.completion_tokens
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_tokens
    }

    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(other.completion_tokens);
        self.total_tokens = self.prompt_tokens.saturating_add(self.completion_tokens);
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_empty(&self) -> bool {
        self.total_tokens == 0
    }

    pub fn to_message_usage(&self) -> MessageUsage {
        MessageUsage { input_tokens: self.prompt_tokens, output_tokens: self.completion_tokens }
    }
}
