use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{ApprovalCategory, Tool, str_param};
use crate::message::ToolResult;

const DEFAULT_MAX_READ_BYTES: usize = 262_144;
const DEFAULT_MAX_ENTRIES: usize = 500;

pub struct ReadTool {
    pub root: PathBuf,
}

pub struct LsTool {
    pub root: PathBuf,
}

pub struct GlobTool {
    pub root: PathBuf,
}

pub struct GrepTool {
    pub root: PathBuf,
}

fn max_param(args: &Value, key: &str, default: usize) -> usize {
    args.get(key).and_then(|v| v.as_u64()).map(|v| v as usize).unwrap_or(default)
}

fn relative_display(path: &str, cwd: &Path) -> String {
    Path::new(path).strip_prefix(cwd).map(|p| p.display().to_string()).unwrap_or_else(|_| path.to_string())
}

#[async_trait]
impl Tool for ReadTool {
    fn name(&self) -> &str {
        "read"
    }

    fn description(&self) -> &str {
        "Read a text file under the working directory. Output is capped at max_bytes."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {"type": "string", "description": "Path relative to the working directory"},
                "max_bytes": {"type": "integer"}
            },
            "required": ["file_path"]
        })
    }

    fn category(&self) -> Option<ApprovalCategory> {
        Some(ApprovalCategory::Read)
    }

    fn display_name(&self) -> Option<&str> {
        Some("Read")
    }

    fn describe(&self, params: &Value, cwd: &Path) -> Option<String> {
        params.get("file_path").and_then(|v| v.as_str()).map(|p| relative_display(p, cwd))
    }

    async fn run(&self, args: Value) -> anyhow::Result<ToolResult> {
        let path = str_param(&args, "file_path")?;
        let max_bytes = max_param(&args, "max_bytes", DEFAULT_MAX_READ_BYTES);
        let content = crate::discovery::read_file_under_root(&self.root, path, max_bytes)?;
        let lines = content.lines().count();
        Ok(ToolResult::ok(content).with_display(json!(format!("Read {lines} lines"))))
    }
}

#[async_trait]
impl Tool for LsTool {
    fn name(&self) -> &str {
        "ls"
    }

    fn description(&self) -> &str {
        "List files and directories under a directory, respecting .gitignore."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "dir_path": {"type": "string", "description": "Directory relative to the working directory"},
                "max": {"type": "integer"}
            }
        })
    }

    fn category(&self) -> Option<ApprovalCategory> {
        Some(ApprovalCategory::Read)
    }

    fn display_name(&self) -> Option<&str> {
        Some("List")
    }

    fn describe(&self, params: &Value, cwd: &Path) -> Option<String> {
        Some(params.get("dir_path").and_then(|v| v.as_str()).map(|p| relative_display(p, cwd)).unwrap_or_else(|| ".".into()))
    }

    async fn run(&self, args: Value) -> anyhow::Result<ToolResult> {
        let dir = args.get("dir_path").and_then(|v| v.as_str()).unwrap_or(".");
        let max = max_param(&args, "max", DEFAULT_MAX_ENTRIES);
        let resolved = crate::discovery::resolve_under_root(&self.root, dir).ok_or_else(|| anyhow::anyhow!("path outside root: {dir}"))?;
        if !resolved.is_dir() {
            anyhow::bail!("not a directory: {dir}");
        }
        let items = crate::discovery::list_files(&resolved, max);
        let listing: Vec<String> = items.iter().map(|e| if e.is_dir { format!("{}/", e.path) } else { e.path.clone() }).collect();
        Ok(ToolResult::ok(listing.join("\n")).with_display(json!(format!("Listed {} paths", items.len()))))
    }
}

#[async_trait]
impl Tool for GlobTool {
    fn name(&self) -> &str {
        "glob"
    }

    fn description(&self) -> &str {
        "Find files whose path matches a glob pattern such as **/*.rs."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {"type": "string"},
                "max": {"type": "integer"}
            },
            "required": ["pattern"]
        })
    }

    fn category(&self) -> Option<ApprovalCategory> {
        Some(ApprovalCategory::Read)
    }

    fn display_name(&self) -> Option<&str> {
        Some("Glob")
    }

    fn describe(&self, params: &Value, _cwd: &Path) -> Option<String> {
        params.get("pattern").and_then(|v| v.as_str()).map(str::to_string)
    }

    async fn run(&self, args: Value) -> anyhow::Result<ToolResult> {
        let pattern = str_param(&args, "pattern")?;
        let max = max_param(&args, "max", DEFAULT_MAX_ENTRIES);
        let items = crate::discovery::glob_files(&self.root, pattern, max)?;
        if items.is_empty() {
            return Ok(ToolResult::ok("No files found"));
        }
        let paths: Vec<&str> = items.iter().map(|e| e.path.as_str()).collect();
        Ok(ToolResult::ok(paths.join("\n")).with_display(json!(format!("Found {} files", items.len()))))
    }
}

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Search file contents with a regular expression. Optionally restrict files with an include glob."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {"type": "string"},
                "include": {"type": "string"},
                "max": {"type": "integer"}
            },
            "required": ["pattern"]
        })
    }

    fn category(&self) -> Option<ApprovalCategory> {
        Some(ApprovalCategory::Read)
    }

    fn display_name(&self) -> Option<&str> {
        Some("Grep")
    }

    fn describe(&self, params: &Value, _cwd: &Path) -> Option<String> {
        params.get("pattern").and_then(|v| v.as_str()).map(str::to_string)
    }

    async fn run(&self, args: Value) -> anyhow::Result<ToolResult> {
        let pattern = str_param(&args, "pattern")?;
        let include = args.get("include").and_then(|v| v.as_str());
        let max = max_param(&args, "max", DEFAULT_MAX_ENTRIES);
        let hits = crate::discovery::grep_files(&self.root, pattern, include, max)?;
        if hits.is_empty() {
            return Ok(ToolResult::ok("No matches found"));
        }
        let lines: Vec<String> = hits.iter().map(|h| format!("{}:{}: {}", h.path, h.line, h.text)).collect();
        Ok(ToolResult::ok(lines.join("\n")).with_display(json!(format!("Found {} matches", hits.len()))))
    }
}
