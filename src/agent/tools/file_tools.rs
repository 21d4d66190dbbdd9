use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{ApprovalCategory, Tool, str_param};
use crate::message::ToolResult;

const PREVIEW_BYTES: usize = 1024;

pub struct WriteTool {
    pub root: PathBuf,
}

#[async_trait]
impl Tool for WriteTool {
    fn name(&self) -> &str {
        "write"
    }

    fn description(&self) -> &str {
        "Write a file under the working directory, replacing it if it exists."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {"type": "string"},
                "content": {"type": "string"}
            },
            "required": ["file_path", "content"]
        })
    }

    fn category(&self) -> Option<ApprovalCategory> {
        Some(ApprovalCategory::Write)
    }

    fn display_name(&self) -> Option<&str> {
        Some("Write")
    }

    fn describe(&self, params: &Value, cwd: &Path) -> Option<String> {
        let p = params.get("file_path").and_then(|v| v.as_str())?;
        Some(Path::new(p).strip_prefix(cwd).map(|r| r.display().to_string()).unwrap_or_else(|_| p.to_string()))
    }

    async fn run(&self, args: Value) -> anyhow::Result<ToolResult> {
        let path = str_param(&args, "file_path")?;
        let content = str_param(&args, "content")?;
        let res = crate::file_ops::write_file_under_root(&self.root, path, content, PREVIEW_BYTES)?;
        let verb = if res.created { "Created" } else { "Updated" };
        Ok(ToolResult::ok(format!("{verb} {path} ({} bytes)", content.len())).with_display(serde_json::to_value(&res)?))
    }
}
