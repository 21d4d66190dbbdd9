use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::agent::tools::{ApprovalCategory, ApprovalContext, ToolRegistry};
use crate::message::ToolUse;
use crate::session::SessionConfigManager;
use crate::settings::ApprovalMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ApprovalDecision {
    Approve,
    /// Approve and add the tool to the session whitelist.
    ApproveAlways,
    Deny,
}

/// What the human-in-the-loop approver is asked about.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub tool_use: ToolUse,
    pub category: Option<ApprovalCategory>,
    pub description: Option<String>,
}

#[async_trait]
pub trait Approver: Send + Sync {
    async fn approve(&self, request: &ApprovalRequest) -> ApprovalDecision;
}

/// Which rule settled a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    Yolo,
    UnknownTool,
    ReadOnly,
    NoApprovalNeeded,
    AutoEdit,
    SessionWhitelist,
    Approver(ApprovalDecision),
    NoApprover,
}

impl DecisionReason {
    pub fn approved(self) -> bool {
        !matches!(self, DecisionReason::Approver(ApprovalDecision::Deny) | DecisionReason::NoApprover)
    }
}

/// Decides whether a proposed tool call may run.
///
/// Rules are checked in a fixed order and the first match wins. Only the
/// final rule consults the approver; without one the call is denied.
pub struct ApprovalPipeline {
    approval_mode: ApprovalMode,
    cwd: PathBuf,
    session_config: Option<Arc<Mutex<SessionConfigManager>>>,
    approver: Option<Arc<dyn Approver>>,
}

impl ApprovalPipeline {
    pub fn new(approval_mode: ApprovalMode, cwd: impl Into<PathBuf>) -> Self {
        Self { approval_mode, cwd: cwd.into(), session_config: None, approver: None }
    }

    pub fn with_session_config(mut self, manager: Arc<Mutex<SessionConfigManager>>) -> Self {
        self.session_config = Some(manager);
        self
    }

    pub fn with_approver(mut self, approver: Arc<dyn Approver>) -> Self {
        self.approver = Some(approver);
        self
    }

    fn session_mode(&self) -> ApprovalMode {
        self.session_config
            .as_ref()
            .and_then(|m| m.lock().ok().map(|m| m.config().approval_mode))
            .unwrap_or_default()
    }

    fn session_allows(&self, tool: &str) -> bool {
        self.session_config
            .as_ref()
            .and_then(|m| m.lock().ok().map(|m| m.config().approval_tools.iter().any(|t| t == tool)))
            .unwrap_or(false)
    }

    fn remember(&self, tool: &str) {
        let Some(manager) = &self.session_config else { return };
        match manager.lock() {
            Ok(mut m) => {
                if let Err(e) = m.allow_tool(tool) {
                    warn!(tool, error = %e, "failed to persist tool approval");
                }
            }
            Err(_) => warn!(tool, "session config lock poisoned"),
        }
    }

    pub async fn decide(&self, tools: &ToolRegistry, tool_use: &ToolUse) -> DecisionReason {
        let reason = self.evaluate(tools, tool_use).await;
        if reason == DecisionReason::Approver(ApprovalDecision::ApproveAlways) {
            self.remember(&tool_use.name);
        }
        debug!(tool = %tool_use.name, call_id = %tool_use.call_id, ?reason, "approval decided");
        reason
    }

    pub async fn approve(&self, tools: &ToolRegistry, tool_use: &ToolUse) -> bool {
        self.decide(tools, tool_use).await.approved()
    }

    async fn evaluate(&self, tools: &ToolRegistry, tool_use: &ToolUse) -> DecisionReason {
        if self.approval_mode == ApprovalMode::Yolo {
            return DecisionReason::Yolo;
        }
        let Some(tool) = tools.get(&tool_use.name) else {
            return DecisionReason::UnknownTool;
        };
        let category = tool.category();
        if category == Some(ApprovalCategory::Read) {
            return DecisionReason::ReadOnly;
        }
        let ctx = ApprovalContext { tool_name: &tool_use.name, params: &tool_use.params, approval_mode: self.approval_mode, cwd: &self.cwd };
        if !tool.needs_approval(&ctx).await {
            return DecisionReason::NoApprovalNeeded;
        }
        if category == Some(ApprovalCategory::Write)
            && (self.session_mode() == ApprovalMode::AutoEdit || self.approval_mode == ApprovalMode::AutoEdit)
        {
            return DecisionReason::AutoEdit;
        }
        if self.session_allows(&tool_use.name) {
            return DecisionReason::SessionWhitelist;
        }
        let Some(approver) = &self.approver else {
            info!(tool = %tool_use.name, "no approver available, denying");
            return DecisionReason::NoApprover;
        };
        let request = ApprovalRequest { tool_use: tool_use.clone(), category, description: tool.describe(&tool_use.params, &self.cwd) };
        DecisionReason::Approver(approver.approve(&request).await)
    }
}
