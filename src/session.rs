use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::history::History;
use crate::settings::ApprovalMode;
use crate::storage::{self, SessionError};
use crate::usage::Usage;

pub type SessionId = String;

#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub usage: Usage,
    pub history: History,
}

impl Session {
    pub fn new(id: SessionId, history: History) -> Self {
        Self { id, usage: Usage::empty(), history }
    }

    pub fn create() -> Self {
        Self::new(Self::create_session_id(), History::default())
    }

    /// Short random id; also the log file stem.
    pub fn create_session_id() -> SessionId {
        let mut buf = Uuid::encode_buffer();
        Uuid::new_v4().simple().encode_lower(&mut buf).chars().take(8).collect()
    }

    /// Rebuilds a session from its log, keeping only the active path.
    pub fn resume(id: SessionId, log_path: &Path) -> Result<Self, SessionError> {
        let messages = storage::load_session_messages(log_path)?;
        Ok(Self::new(id, History::new(messages, None)))
    }

    pub fn update_history(&mut self, history: History) {
        self.history = history;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(default)]
    pub approval_mode: ApprovalMode,
    #[serde(default)]
    pub approval_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub pasted_text_map: BTreeMap<String, String>,
    #[serde(default)]
    pub pasted_image_map: BTreeMap<String, String>,
}

/// Session-scoped settings stored as the `config` line of the session log.
///
/// Loaded on first access; every mutation rewrites the log in place.
#[derive(Debug)]
pub struct SessionConfigManager {
    log_path: PathBuf,
    config: OnceLock<SessionConfig>,
}

impl SessionConfigManager {
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self { log_path: log_path.into(), config: OnceLock::new() }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn config(&self) -> &SessionConfig {
        self.config.get_or_init(|| storage::read_config(&self.log_path).unwrap_or_default())
    }

    pub fn update(&mut self, f: impl FnOnce(&mut SessionConfig)) -> Result<(), SessionError> {
        let mut next = self.config().clone();
        f(&mut next);
        storage::write_config(&self.log_path, &next)?;
        self.config = OnceLock::from(next);
        Ok(())
    }

    pub fn allow_tool(&mut self, tool: &str) -> Result<(), SessionError> {
        if self.config().approval_tools.iter().any(|t| t == tool) {
            return Ok(());
        }
        self.update(|c| c.approval_tools.push(tool.to_string()))
    }

    pub fn set_approval_mode(&mut self, mode: ApprovalMode) -> Result<(), SessionError> {
        self.update(|c| c.approval_mode = mode)
    }
}
