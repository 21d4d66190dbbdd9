use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::history::active_path;
use crate::message::Message;
use crate::session::SessionConfig;

/// One line of a session log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LogLine {
    Message(Message),
    Config { config: SessionConfig },
    #[serde(other)]
    Other,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to access session log {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse line {line} of session log {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize session record: {0}")]
    Serialize(#[from] serde_json::Error),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> SessionError + '_ {
    move |source| SessionError::Io { path: path.to_path_buf(), source }
}

pub trait SessionRepository: Send + Sync {
    fn log_path(&self, session_id: &str) -> PathBuf;
    fn append_message(&self, session_id: &str, message: &Message) -> Result<(), SessionError>;
    /// Active path of the persisted conversation.
    fn load_messages(&self, session_id: &str) -> Result<Vec<Message>, SessionError>;
    fn list_sessions(&self) -> Result<Vec<String>, SessionError>;
}

#[derive(Debug, Clone)]
pub struct JsonlSessionRepository {
    dir: PathBuf,
}

impl JsonlSessionRepository {
    pub fn initialize(dir: Option<PathBuf>) -> anyhow::Result<Self> {
        let dir = match dir {
            Some(d) => d,
            None => resolve_default_sessions_dir(),
        };
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

pub fn resolve_default_sessions_dir() -> PathBuf {
    let base = std::env::var("XDG_DATA_HOME").ok().map(PathBuf::from).unwrap_or_else(|| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        PathBuf::from(home).join(".local").join("share")
    });
    base.join("agent_runtime").join("sessions")
}

impl SessionRepository for JsonlSessionRepository {
    fn log_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.jsonl"))
    }

    fn append_message(&self, session_id: &str, message: &Message) -> Result<(), SessionError> {
        append_line(&self.log_path(session_id), &LogLine::Message(message.clone()))
    }

    fn load_messages(&self, session_id: &str) -> Result<Vec<Message>, SessionError> {
        load_session_messages(&self.log_path(session_id))
    }

    fn list_sessions(&self) -> Result<Vec<String>, SessionError> {
        let entries = fs::read_dir(&self.dir).map_err(io_err(&self.dir))?;
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_err(&self.dir))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else { continue };
            let modified = entry.metadata().and_then(|m| m.modified()).ok();
            found.push((modified, stem.to_string()));
        }
        found.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(found.into_iter().map(|(_, id)| id).collect())
    }
}

pub fn append_line(path: &Path, line: &LogLine) -> Result<(), SessionError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let json = serde_json::to_string(line)?;
    let mut f = OpenOptions::new().create(true).append(true).open(path).map_err(io_err(path))?;
    writeln!(f, "{json}").map_err(io_err(path))?;
    Ok(())
}

/// Every line of the log, parsed strictly. A missing file is an empty log.
pub fn read_log(path: &Path) -> Result<Vec<LogLine>, SessionError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path).map_err(io_err(path))?;
    content
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(i, l)| {
            serde_json::from_str::<LogLine>(l).map_err(|source| SessionError::Parse { path: path.to_path_buf(), line: i + 1, source })
        })
        .collect()
}

pub fn load_session_messages(path: &Path) -> Result<Vec<Message>, SessionError> {
    let messages: Vec<Message> = read_log(path)?
        .into_iter()
        .filter_map(|l| match l {
            LogLine::Message(m) => Some(m),
            _ => None,
        })
        .collect();
    Ok(active_path(&messages))
}

/// First config record in the log. Unreadable lines are skipped so a torn
/// message line never hides the session's settings.
pub fn read_config(path: &Path) -> Option<SessionConfig> {
    let content = fs::read_to_string(path).ok()?;
    content.lines().filter(|l| !l.trim().is_empty()).find_map(|l| match serde_json::from_str::<LogLine>(l) {
        Ok(LogLine::Config { config }) => Some(config),
        _ => None,
    })
}

/// Rewrites the log with exactly one config line followed by every other line in order.
pub fn write_config(path: &Path, config: &SessionConfig) -> Result<(), SessionError> {
    let config_line = serde_json::to_string(&LogLine::Config { config: config.clone() })?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let existing = if path.exists() { fs::read_to_string(path).map_err(io_err(path))? } else { String::new() };
    let mut out = String::with_capacity(existing.len() + config_line.len() + 1);
    out.push_str(&config_line);
    out.push('\n');
    for line in existing.lines().filter(|l| !l.trim().is_empty()) {
        let is_config = serde_json::from_str::<serde_json::Value>(line)
            .map(|v| v.get("type").and_then(|t| t.as_str()) == Some("config"))
            .unwrap_or(false);
        if !is_config {
            out.push_str(line);
            out.push('\n');
        }
    }
    let tmp = path.with_extension("jsonl.tmp");
    fs::write(&tmp, out).map_err(io_err(&tmp))?;
    fs::rename(&tmp, path).map_err(io_err(path))?;
    debug!(path = %path.display(), "session config written");
    Ok(())
}
