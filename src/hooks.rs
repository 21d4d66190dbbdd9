//! Plugin extension points around the loop.
//!
//! Every hook has one composition strategy:
//! - replace-last: each plugin receives the previous plugin's output and the last output wins
//!   (`system_prompt`, `tool_use`, `tool_result`);
//! - merge-accumulate: each plugin returns entries that are merged into the running map
//!   (`context`, `env`);
//! - fan-out-parallel: all plugins are notified concurrently and nothing is returned
//!   (`turn`, `conversation`).
//!
//! A failing plugin is logged and skipped; it never aborts the run.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::warn;

use crate::agent::engine::FailureKind;
use crate::message::{ToolResult, ToolUse};
use crate::usage::Usage;

/// Ordered name/value pairs; merging replaces existing names in place.
pub type Entries = Vec<(String, String)>;

pub fn merge_entries(into: &mut Entries, from: Entries) {
    for (key, value) in from {
        match into.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => into.push((key, value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HookContext {
    pub session_id: String,
    pub is_plan: bool,
    pub user_prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnEvent {
    pub usage: Usage,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationEvent {
    pub success: bool,
    pub text: Option<String>,
    pub failure: Option<FailureKind>,
    pub usage: Usage,
    pub turns_count: u32,
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    async fn system_prompt(&self, _ctx: &HookContext, prompt: String) -> anyhow::Result<String> {
        Ok(prompt)
    }

    async fn context(&self, _ctx: &HookContext) -> anyhow::Result<Entries> {
        Ok(Vec::new())
    }

    async fn env(&self, _ctx: &HookContext) -> anyhow::Result<Entries> {
        Ok(Vec::new())
    }

    async fn tool_use(&self, _ctx: &HookContext, tool_use: ToolUse) -> anyhow::Result<ToolUse> {
        Ok(tool_use)
    }

    async fn tool_result(&self, _ctx: &HookContext, _tool_use: &ToolUse, result: ToolResult, _approved: bool) -> anyhow::Result<ToolResult> {
        Ok(result)
    }

    async fn turn(&self, _ctx: &HookContext, _event: &TurnEvent) -> anyhow::Result<()> {
        Ok(())
    }

    async fn conversation(&self, _ctx: &HookContext, _event: &ConversationEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct HookRegistry {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub async fn system_prompt(&self, ctx: &HookContext, initial: String) -> String {
        let mut memo = initial;
        for p in &self.plugins {
            match p.system_prompt(ctx, memo.clone()).await {
                Ok(next) => memo = next,
                Err(e) => warn!(plugin = p.name(), hook = "system_prompt", error = %e, "plugin hook failed"),
            }
        }
        memo
    }

    pub async fn context(&self, ctx: &HookContext, initial: Entries) -> Entries {
        let mut memo = initial;
        for p in &self.plugins {
            match p.context(ctx).await {
                Ok(entries) => merge_entries(&mut memo, entries),
                Err(e) => warn!(plugin = p.name(), hook = "context", error = %e, "plugin hook failed"),
            }
        }
        memo
    }

    pub async fn env(&self, ctx: &HookContext, initial: Entries) -> Entries {
        let mut memo = initial;
        for p in &self.plugins {
            match p.env(ctx).await {
                Ok(entries) => merge_entries(&mut memo, entries),
                Err(e) => warn!(plugin = p.name(), hook = "env", error = %e, "plugin hook failed"),
            }
        }
        memo
    }

    pub async fn tool_use(&self, ctx: &HookContext, tool_use: ToolUse) -> ToolUse {
        let mut memo = tool_use;
        for p in &self.plugins {
            match p.tool_use(ctx, memo.clone()).await {
                Ok(next) => memo = next,
                Err(e) => warn!(plugin = p.name(), hook = "tool_use", error = %e, "plugin hook failed"),
            }
        }
        memo
    }

    pub async fn tool_result(&self, ctx: &HookContext, tool_use: &ToolUse, result: ToolResult, approved: bool) -> ToolResult {
        let mut memo = result;
        for p in &self.plugins {
            match p.tool_result(ctx, tool_use, memo.clone(), approved).await {
                Ok(next) => memo = next,
                Err(e) => warn!(plugin = p.name(), hook = "tool_result", error = %e, "plugin hook failed"),
            }
        }
        memo
    }

    pub async fn turn(&self, ctx: &HookContext, event: &TurnEvent) {
        let results = join_all(self.plugins.iter().map(|p| p.turn(ctx, event))).await;
        for (p, r) in self.plugins.iter().zip(results) {
            if let Err(e) = r {
                warn!(plugin = p.name(), hook = "turn", error = %e, "plugin hook failed");
            }
        }
    }

    pub async fn conversation(&self, ctx: &HookContext, event: &ConversationEvent) {
        let results = join_all(self.plugins.iter().map(|p| p.conversation(ctx, event))).await;
        for (p, r) in self.plugins.iter().zip(results) {
            if let Err(e) = r {
                warn!(plugin = p.name(), hook = "conversation", error = %e, "plugin hook failed");
            }
        }
    }
}
