use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_TURNS: u32 = 50;
pub const DEFAULT_MAX_RETRY_TURNS: u32 = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "camelCase")]
pub enum ApprovalMode {
    #[default]
    Default,
    #[value(name = "autoEdit")]
    AutoEdit,
    Yolo,
}

/// Contents of the global `config.json`. Every field is optional.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    pub model: Option<String>,
    pub plan_model: Option<String>,
    pub approval_mode: Option<ApprovalMode>,
    pub max_turns: Option<u32>,
    pub max_retry_turns: Option<u32>,
    pub auto_compact: Option<bool>,
    pub temperature: Option<f32>,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RequestOverrides {
    pub model: Option<String>,
    pub approval_mode: Option<ApprovalMode>,
    pub max_turns: Option<u32>,
    pub max_retry_turns: Option<u32>,
    pub auto_compact: Option<bool>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EffectiveSettings {
    pub model: Option<String>,
    pub plan_model: Option<String>,
    /// Process-wide mode: request flag, else global config. The session's own
    /// mode is read live from its log by the approval pipeline.
    pub approval_mode: ApprovalMode,
    pub max_turns: u32,
    pub max_retry_turns: u32,
    pub auto_compact: bool,
    pub temperature: Option<f32>,
    pub base_url: Option<String>,
}

pub fn resolve_effective_settings(global: &GlobalConfig, request: &RequestOverrides) -> EffectiveSettings {
    EffectiveSettings {
        model: request.model.clone().or_else(|| global.model.clone()),
        plan_model: global.plan_model.clone(),
        approval_mode: request.approval_mode.or(global.approval_mode).unwrap_or_default(),
        max_turns: request.max_turns.or(global.max_turns).unwrap_or(DEFAULT_MAX_TURNS),
        max_retry_turns: request.max_retry_turns.or(global.max_retry_turns).unwrap_or(DEFAULT_MAX_RETRY_TURNS),
        auto_compact: request.auto_compact.or(global.auto_compact).unwrap_or(true),
        temperature: request.temperature.or(global.temperature),
        base_url: global.base_url.clone(),
    }
}

pub fn resolve_config_dir() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME").ok().map(PathBuf::from).unwrap_or_else(|| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        PathBuf::from(home).join(".config")
    });
    base.join("agent_runtime")
}

/// Reads `config.json`; a missing file means defaults.
pub fn load_global_config(path: &Path) -> anyhow::Result<GlobalConfig> {
    if !path.exists() {
        return Ok(GlobalConfig::default());
    }
    let raw = std::fs::read_to_string(path)?;
    let config = serde_json::from_str(&raw).map_err(|e| anyhow::anyhow!("invalid config {}: {e}", path.display()))?;
    Ok(config)
}
