use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::message::ToolResult;
use crate::models::ToolSchema;
use crate::settings::ApprovalMode;

pub mod discovery_tools;
pub mod file_tools;

/// Risk class used for default approval decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalCategory {
    Read,
    Write,
    Command,
    Network,
}

pub struct ApprovalContext<'a> {
    pub tool_name: &'a str,
    pub params: &'a Value,
    pub approval_mode: ApprovalMode,
    pub cwd: &'a Path,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON schema of the parameters object.
    fn parameters(&self) -> Value;
    fn category(&self) -> Option<ApprovalCategory> {
        None
    }
    fn display_name(&self) -> Option<&str> {
        None
    }
    /// Short human-readable summary of one call, e.g. the path it touches.
    fn describe(&self, _params: &Value, _cwd: &Path) -> Option<String> {
        None
    }
    /// Tools without their own rule always fall through to the remaining checks.
    async fn needs_approval(&self, _ctx: &ApprovalContext<'_>) -> bool {
        true
    }
    async fn run(&self, params: Value) -> anyhow::Result<ToolResult>;
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    pub fn read_only_tools(cwd: &Path) -> Self {
        let root = cwd.to_path_buf();
        let mut r = Self::new();
        r.register(Arc::new(discovery_tools::ReadTool { root: root.clone() }));
        r.register(Arc::new(discovery_tools::LsTool { root: root.clone() }));
        r.register(Arc::new(discovery_tools::GlobTool { root: root.clone() }));
        r.register(Arc::new(discovery_tools::GrepTool { root }));
        r
    }

    pub fn with_default_tools(cwd: &Path) -> Self {
        let mut r = Self::read_only_tools(cwd);
        r.register(Arc::new(file_tools::WriteTool { root: PathBuf::from(cwd) }));
        r
    }

    /// Adds a tool, replacing any tool already registered under the same name.
    pub fn register(&mut self, t: Arc<dyn Tool>) {
        self.tools.retain(|existing| existing.name() != t.name());
        self.tools.push(t);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.iter().map(|b| b.as_ref()).find(|t| t.name() == name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools
            .iter()
            .map(|t| ToolSchema { name: t.name().to_string(), description: t.description().to_string(), parameters: t.parameters() })
            .collect()
    }

    /// Runs a tool by name. Every failure comes back as an error-flagged result.
    pub async fn invoke(&self, name: &str, args: &str) -> ToolResult {
        let Some(tool) = self.get(name) else {
            return ToolResult::error(format!("Tool {name} not found"));
        };
        let params: Value = match serde_json::from_str(args) {
            Ok(v) => v,
            Err(e) => return ToolResult::error(format!("Tool parameters parse failed: {e}")),
        };
        match tool.run(params).await {
            Ok(result) => result,
            Err(e) => {
                debug!(tool = name, error = %e, "tool failed");
                ToolResult::error(format!("Tool {name} failed: {e:#}"))
            }
        }
    }
}

pub(crate) fn str_param<'a>(args: &'a Value, key: &str) -> anyhow::Result<&'a str> {
    args.get(key).and_then(|v| v.as_str()).ok_or_else(|| anyhow::anyhow!("missing {key}"))
}
