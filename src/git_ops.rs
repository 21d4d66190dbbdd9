use git2::{Repository, Status, StatusOptions};
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Serialize)]
pub struct GitStatusEntry {
    pub path: String,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct GitSummary {
    pub branch: Option<String>,
    pub entries: Vec<GitStatusEntry>,
    pub last_commit: Option<String>,
}

fn short_status(s: Status) -> &'static str {
    if s.is_wt_new() || s.is_index_new() {
        "??"
    } else if s.is_wt_deleted() || s.is_index_deleted() {
        "D"
    } else if s.is_wt_renamed() || s.is_index_renamed() {
        "R"
    } else if s.is_conflicted() {
        "U"
    } else {
        "M"
    }
}

/// Branch, working tree changes and head commit, or `None` outside a repository.
pub fn status(root: &Path) -> anyhow::Result<Option<GitSummary>> {
    let repo = match Repository::discover(root) {
        Ok(r) => r,
        Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut opts = StatusOptions::new();
    opts.include_untracked(true).recurse_untracked_dirs(true);
    let statuses = repo.statuses(Some(&mut opts))?;
    let entries = statuses
        .iter()
        .filter(|e| !e.status().is_ignored())
        .map(|e| GitStatusEntry { path: e.path().unwrap_or("").to_string(), status: short_status(e.status()).to_string() })
        .collect();
    let head = repo.head().ok();
    let branch = head.as_ref().and_then(|h| h.shorthand().map(str::to_string));
    let last_commit = head
        .and_then(|h| h.peel_to_commit().ok())
        .map(|c| format!("{} {}", short_oid(c.id()), c.summary().unwrap_or("")));
    Ok(Some(GitSummary { branch, entries, last_commit }))
}

fn short_oid(oid: git2::Oid) -> String {
    oid.to_string().chars().take(7).collect()
}

/// Renders a summary the way it is shown to the model.
pub fn llm_git_status(summary: &GitSummary) -> String {
    let mut out = String::from("This is the git status at the start of the conversation.\n");
    out.push_str(&format!("Current branch: {}\n", summary.branch.as_deref().unwrap_or("(detached)")));
    if let Some(c) = &summary.last_commit {
        out.push_str(&format!("Last commit: {c}\n"));
    }
    out.push_str("\nStatus:\n");
    if summary.entries.is_empty() {
        out.push_str("(clean)");
    } else {
        let lines: Vec<String> = summary.entries.iter().map(|e| format!("{} {}", e.status, e.path)).collect();
        out.push_str(&lines.join("\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn status_sees_untracked_file() {
        let dir = tempdir().unwrap();
        let _repo = Repository::init(dir.path()).unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let summary = status(dir.path()).unwrap().unwrap();
        assert!(summary.entries.iter().any(|e| e.path.ends_with("a.txt") && e.status == "??"));
        let text = llm_git_status(&summary);
        assert!(text.contains("?? a.txt"));
    }

    #[test]
    fn short_oid_keeps_seven_hex_digits() {
        let oid = git2::Oid::from_str("0123456789abcdef0123456789abcdef01234567").unwrap();
        assert_eq!(short_oid(oid), "0123456");
    }

    #[test]
    fn outside_a_repository_is_none() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("plain");
        fs::create_dir_all(&nested).unwrap();
        // tempdirs normally live outside any repository
        if Repository::discover(&nested).is_err() {
            assert!(status(&nested).unwrap().is_none());
        }
    }
}
