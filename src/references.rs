//! `@path` references in the user's prompt.

use std::path::Path;

use regex::Regex;
use tracing::debug;

use crate::discovery::{list_files, read_file_under_root, resolve_under_root};
use crate::models::{PromptMessage, PromptPart, PromptRole};

const MAX_FILE_BYTES: usize = 262_144;
const MAX_DIR_ENTRIES: usize = 200;

const REFERENCE_PATTERN: &str = r#"(?:^|\s)@(?:"([^"]+)"|([^\s"]+))"#;

/// Paths referenced as `@path` or `@"path with spaces"`, deduplicated, in order.
pub fn find_references(text: &str) -> Vec<String> {
    let Ok(re) = Regex::new(REFERENCE_PATTERN) else { return Vec::new() };
    let mut out: Vec<String> = Vec::new();
    for caps in re.captures_iter(text) {
        let Some(m) = caps.get(1).or_else(|| caps.get(2)) else { continue };
        let path = m.as_str().trim_end_matches(['.', ',', ';', ':', ')']).to_string();
        if !path.is_empty() && !out.contains(&path) {
            out.push(path);
        }
    }
    out
}

fn render_reference(cwd: &Path, rel: &str) -> Option<String> {
    let resolved = resolve_under_root(cwd, rel)?;
    if resolved.is_dir() {
        let listing: Vec<String> = list_files(&resolved, MAX_DIR_ENTRIES)
            .into_iter()
            .map(|e| if e.is_dir { format!("{}/", e.path) } else { e.path })
            .collect();
        return Some(format!("<directory path=\"{rel}\">\n{}\n</directory>", listing.join("\n")));
    }
    let content = read_file_under_root(cwd, rel, MAX_FILE_BYTES).ok()?;
    Some(format!("<file path=\"{rel}\">\n{content}\n</file>"))
}

/// Appends the contents of every file or directory referenced in the last
/// user message to that message. Returns how many references were expanded.
pub fn expand_references(prompt: &mut [PromptMessage], cwd: &Path) -> usize {
    let Some(last_user) = prompt.iter_mut().rev().find(|m| m.role == PromptRole::User) else {
        return 0;
    };
    let blocks: Vec<String> = find_references(&last_user.text()).iter().filter_map(|rel| render_reference(cwd, rel)).collect();
    if blocks.is_empty() {
        return 0;
    }
    debug!(count = blocks.len(), "expanded prompt references");
    let n = blocks.len();
    last_user.parts.push(PromptPart::Text { text: format!("\n\nThis is the content of the referenced files and directories:\n{}", blocks.join("\n")) });
    n
}
