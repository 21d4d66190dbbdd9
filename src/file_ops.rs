use crate::discovery::resolve_under_root;
use serde::Serialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteOutcome {
    pub path: String,
    pub created: bool,
    pub before_preview: String,
    pub after_preview: String,
}

fn cap_utf8(mut bytes: Vec<u8>, max_bytes: usize) -> String {
    if bytes.len() > max_bytes {
        bytes.truncate(max_bytes);
    }
    String::from_utf8_lossy(&bytes).to_string()
}

/// Writes `content` to `rel` under `root`, creating parent directories.
pub fn write_file_under_root(root: &Path, rel: &str, content: &str, preview_bytes: usize) -> anyhow::Result<WriteOutcome> {
    let path = resolve_under_root(root, rel).ok_or_else(|| anyhow::anyhow!("path outside root: {rel}"))?;
    if path.is_dir() {
        anyhow::bail!("{rel} is a directory");
    }
    let existed = path.exists();
    let before = if existed { fs::read(&path)? } else { Vec::new() };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, content.as_bytes())?;
    Ok(WriteOutcome {
        path: path.display().to_string(),
        created: !existed,
        before_preview: cap_utf8(before, preview_bytes),
        after_preview: cap_utf8(content.as_bytes().to_vec(), preview_bytes),
    })
}
